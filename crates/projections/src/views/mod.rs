//! Auxiliary read-model views fed by the dispatcher's asynchronous handlers.

mod user_entities;

pub use user_entities::UserEntitiesView;
