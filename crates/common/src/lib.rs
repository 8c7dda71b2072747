// studio-collab-common: shared types for the collaborative page editor

pub mod operation;
pub mod protocol;
pub mod types;
