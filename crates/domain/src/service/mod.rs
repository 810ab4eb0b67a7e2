pub mod entity;
pub mod error;
pub mod l7;
pub mod maglev;
pub mod options;
pub mod record;
pub mod tracker;
