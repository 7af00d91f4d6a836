// Background job tracking: status polling, payload normalization, session mirror,
// and the handlers the recruiter UI uses to drive it.
// All backend calls go through remote::JobService; nothing here builds HTTP requests.

pub mod handlers;
pub mod normalize;
pub mod progress;
pub mod store;
pub mod tracker;
