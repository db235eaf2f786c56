// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod allowed_ips;
pub mod device;
pub mod engine;
pub mod error;

pub use allowed_ips::AllowedIps;
pub use device::{VirtualDevice, VirtualTcpListener, VirtualTcpStream};
pub use engine::{WgEngine, WgEngineConfig, DEFAULT_MTU, MIN_MTU};
pub use error::{EngineError, Result};
