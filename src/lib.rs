#![allow(non_snake_case)]

use types::Float;
pub extern crate nalgebra as na;

pub mod dynamics_model;
pub mod error;
pub mod finite_difference;
pub mod fitter;
pub mod force_plate;
pub mod geometry;
pub mod inertia;
pub mod joint;
pub mod nlp;
pub mod problem;
pub mod residual;
pub mod skeleton;
pub mod smoother;
pub mod spatial;
pub mod types;
pub mod util;

pub mod helpers;

pub const GRAVITY: Float = 9.81;

pub const PI: Float = std::f64::consts::PI;
