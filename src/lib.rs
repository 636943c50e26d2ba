pub mod cli;
pub mod driver;
pub mod exporter;
pub mod fast_import;
pub mod identities;
pub mod log;
pub mod marks;
pub mod mergeinfo;
pub mod repository;
pub mod rules;
pub mod svn;
pub mod transaction;
pub mod util;
