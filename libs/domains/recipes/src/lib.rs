//! Recipe-processing domain: the data model, repository contracts, and
//! concrete pipelines (C11) that compose the ambient job-pipeline engine
//! crates into the recipe-import workflow.

pub mod collaborators;
pub mod models;
pub mod pipelines;
pub mod repository;
