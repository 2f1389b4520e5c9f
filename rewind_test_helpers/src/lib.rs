//! Collaborators for tests that need storage to misbehave on cue.

pub mod object_store;
