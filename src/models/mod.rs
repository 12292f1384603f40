// Data models for the Strava API and the destination table

pub mod activity;
pub mod strava;

pub use activity::ActivityRow;
pub use strava::{ActivityRecord, PageRequest, DEFAULT_PER_PAGE, MAX_PER_PAGE};
