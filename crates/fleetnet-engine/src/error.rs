// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// Keys, endpoint or interface parameters the engine refuses to run with.
	#[error("invalid engine configuration: {0}")]
	InvalidConfig(String),

	#[error("WireGuard error: {0}")]
	WireGuard(String),

	#[error("already running")]
	AlreadyRunning,

	#[error("engine closed")]
	Closed,

	#[error("virtual device error: {0}")]
	Device(String),

	#[error("no route to {0}")]
	NoRoute(String),

	#[error("connection refused by {0}")]
	ConnectionRefused(String),

	#[error("TCP connection failed: {0}")]
	TcpConnect(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
