//! Stokes mobility
//!
//! Matrix-free operators and block preconditioners for elastic fibers, rigid bodies and
//! a confining periphery coupled through a viscous fluid.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;

pub mod body;
pub mod collision;
pub mod distribution;
pub mod fiber;
pub mod geometry;
pub mod kernel;
pub mod linalg;
pub mod params;
pub mod periphery;
pub mod system;
pub mod traits;
pub mod types;
