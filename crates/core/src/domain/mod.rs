pub mod entity;
pub mod instance;
pub mod payload;
pub mod tenant;
pub mod workflow;
