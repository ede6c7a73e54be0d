//! Count mussel larvae on uploaded images with a pretrained detection model.
pub mod annotate;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod nn;
pub mod page;
pub mod session;

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Hash a value with the standard hasher.
pub fn hashed<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
