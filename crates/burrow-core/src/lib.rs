//! Core types and traits for the Burrow URL shortener.
//!
//! This crate provides the storage contract shared by every backend and by
//! the front ends that call into it.

pub mod error;
pub mod repository;
pub mod shortcode;

pub use error::{CoreError, ErrorKind, GeneratorError, Result, StorageError};
pub use repository::{BatchItem, ReadRepository, Repository, ShortenedItem, Statistics, UrlRecord};
pub use shortcode::ShortCode;
