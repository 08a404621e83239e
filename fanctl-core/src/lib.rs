//
// fanctl firmware core for fan and heater controllers
// Copyright (C) 2022 Sebastian Urban <surban@surban.net>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//

//! fanctl hardware independent core.
//!
//! Software timers, foreground events, the I2C transaction engine and the
//! thermal control logic built on them.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod cfg;
pub mod console;
pub mod event;
pub mod fan;
pub mod heater;
pub mod i2c;
pub mod i2c_engine;
pub mod rtd;
pub mod thermal;
pub mod timer;
pub mod tmp1075;

/// Tick period in milliseconds.
pub const TICK_MS: u32 = 1;
