pub mod policy;
pub mod profile;
pub mod run;
pub mod setup;
pub mod status;
pub mod utils;
