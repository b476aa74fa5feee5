#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod classify;
pub mod convert;
pub mod descriptor;
pub mod entity;
pub mod generate;
pub mod policy;

pub use self::{
    classify::Classify,
    convert::{convert, ConversionError},
    descriptor::{Direction, NetworkDescriptor, Peer},
    entity::{Entities, Entity, EntityKind},
    generate::{Generate, GenerateError},
    policy::{PolicyKind, PolicySpec, StructuredPolicy},
};

pub const CONTROLLER_NAME: &str = "intent-policy-controller";
