pub mod app;
pub mod cache;
pub mod clinical;
pub mod cohort;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod mri;
pub mod output;
pub mod ppmi;
pub mod store;
