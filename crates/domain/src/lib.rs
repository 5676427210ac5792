//! Domain layer for the entity service.
//!
//! This crate provides:
//! - the [`Entity`] aggregate
//! - [`EntityEvent`], the typed view of entity events with its wire encoding
//! - [`Command`] types with an explicit validation stage

pub mod command;
pub mod entity;
pub mod error;

pub use command::Command;
pub use entity::{CreateEntity, DeleteEntity, Entity, EntityEvent, UpdateEntity};
pub use error::{DecodeError, ValidationError};
