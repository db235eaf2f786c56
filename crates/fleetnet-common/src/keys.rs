// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Curve25519 tunnel identity.
//!
//! A fresh [`LocalKeyPair`] is drawn for every tunnel attempt. Keys travel as
//! padded standard base64 on the wire and reach the engine as raw bytes.

use crate::secret::Secret;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("malformed key: {0}")]
	MalformedKey(String),

	#[error("entropy source unavailable: {0}")]
	EntropyUnavailable(String),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_base64(s: &str) -> Result<[u8; KEY_LEN]> {
	let mut bytes = STANDARD
		.decode(s.trim())
		.map_err(|e| KeyError::MalformedKey(format!("invalid base64 encoding: {e}")))?;
	let arr = to_key_bytes(&bytes);
	bytes.zeroize();
	arr
}

fn to_key_bytes(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
	if bytes.len() != KEY_LEN {
		return Err(KeyError::MalformedKey(format!(
			"expected {KEY_LEN} bytes, got {}",
			bytes.len()
		)));
	}
	let mut arr = [0u8; KEY_LEN];
	arr.copy_from_slice(bytes);
	Ok(arr)
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; KEY_LEN],
}

impl WgPrivateKey {
	/// Draws 32 bytes from the operating system's CSPRNG.
	///
	/// `OsRng` is safe to use from concurrent establishments; clamping happens
	/// inside the scalar multiplication.
	pub fn generate() -> Result<Self> {
		let mut bytes = [0u8; KEY_LEN];
		OsRng
			.try_fill_bytes(&mut bytes)
			.map_err(|e| KeyError::EntropyUnavailable(e.to_string()))?;
		let key = Self { bytes };
		bytes.zeroize();
		Ok(key)
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn to_base64(&self) -> Secret<String> {
		Secret::new(STANDARD.encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = PublicKey::from(&secret);
		WgPublicKey {
			bytes: *public.as_bytes(),
		}
	}

	/// Whether a Diffie-Hellman exchange with `peer` yields a contributory
	/// shared secret. Fails for the all-zero key and other low-order points.
	pub fn agrees_with(&self, peer: &WgPublicKey) -> bool {
		let secret = StaticSecret::from(self.bytes);
		secret
			.diffie_hellman(&PublicKey::from(peer.bytes))
			.was_contributory()
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgPublicKey {
	bytes: [u8; KEY_LEN],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_base64(s)?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", &b64[..8]))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// The client's identity for one tunnel attempt. Dropping it zeroizes the
/// private half.
#[derive(Clone)]
pub struct LocalKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl LocalKeyPair {
	pub fn generate() -> Result<Self> {
		let private = WgPrivateKey::generate()?;
		Ok(Self::from_private_key(private))
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key_base64: &str) -> Result<Self> {
		let private = WgPrivateKey::from_base64(private_key_base64)?;
		Ok(Self::from_private_key(private))
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for LocalKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LocalKeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}
