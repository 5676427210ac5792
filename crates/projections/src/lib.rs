//! Read-model synchronization for the CQRS query side.
//!
//! This crate provides:
//! - [`Synchronizer`], which applies entity events to a [`storage::ReadStore`]
//! - [`UserEntitiesView`], an auxiliary projection indexing entities by owner

pub mod error;
pub mod synchronizer;
pub mod views;

pub use error::{ProjectionError, Result};
pub use synchronizer::{Applied, Synchronizer};
pub use views::UserEntitiesView;
