// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash slot resolution for components with a master/slave flash pair.

use crate::error::RequestError;
use fwmgr_messages::FlashMode;
use fwmgr_messages::FlashSlot;
use std::str::FromStr;

/// Parse a caller-supplied flash mode token.
pub fn parse_mode(token: &str) -> Result<FlashMode, RequestError> {
    FlashMode::from_str(token.trim())
        .map_err(|_| RequestError::InvalidMode(token.to_string()))
}

/// Slots to install, in installation order, given the slot the component is
/// currently running from.
///
/// For [`FlashMode::Both`] the order is significant: if the master install
/// fails the slave must not be attempted.
pub fn resolve(current: FlashSlot, mode: FlashMode) -> Vec<FlashSlot> {
    fixed_targets(mode).unwrap_or_else(|| vec![current.opposite()])
}

/// Slots to install for modes that do not depend on the running slot;
/// `None` for [`FlashMode::PingPong`].
pub fn fixed_targets(mode: FlashMode) -> Option<Vec<FlashSlot>> {
    match mode {
        FlashMode::Master => Some(vec![FlashSlot::Master]),
        FlashMode::Slave => Some(vec![FlashSlot::Slave]),
        FlashMode::Both => Some(vec![FlashSlot::Master, FlashSlot::Slave]),
        FlashMode::PingPong => None,
    }
}
