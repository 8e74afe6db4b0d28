//! Train a convolutional MNIST digit classifier and export it for the browser.
#![recursion_limit = "256"]

pub mod backend;
pub mod callback;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod model;
pub mod training;

pub use error::{Error, Result};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;
#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
