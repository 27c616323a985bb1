//! MirrorSource custom resource types.

#![forbid(unsafe_code)]

pub mod v1alpha1;

pub use v1alpha1::{MirrorSource, MirrorSourceSpec, MirrorSourceStatus, ReconcileError};
