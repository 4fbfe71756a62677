// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for the fabric (config resolution).
//! Keeps storage adapters thin and framework-agnostic.

pub mod config;
