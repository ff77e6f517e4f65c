#![allow(
    clippy::derivable_impls,
    clippy::io_other_error,
    clippy::len_without_is_empty,
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;

pub use common::{Address, TunnelError, TunnelErrorKind};
pub use proxy::{HopKind, HopSpec, Tunnel};
