//! In-call controls
//!
//! Mute, DTMF and hold for the active call. Controls the owning transport
//! does not support are no-ops rather than errors: the peer transport has no
//! DTMF or hold.

use tracing::{debug, info};

use super::types::CallState;
use crate::error::{ClientError, ClientResult};
use crate::lifecycle::CallMode;

/// Matches what carrier DTMF accepts
fn is_dtmf(digits: &str) -> bool {
    !digits.is_empty() && digits.chars().all(|c| matches!(c, '0'..='9' | '*' | '#' | 'w' | 'W' | 'A'..='D'))
}

impl super::manager::CallOrchestrator {
    /// Flip the microphone mute of the active call; returns the new state
    pub async fn toggle_mute(&self) -> ClientResult<bool> {
        let (call_id, muted, carrier_call) = {
            let active = self.active.lock();
            let call = active.as_ref().ok_or(ClientError::NoActiveCall)?;
            (call.info.call_id.clone(), !call.info.muted, call.carrier_call.clone())
        };

        match carrier_call {
            Some(call) => call.mute(muted).await?,
            None => self.engine.set_muted(muted)?,
        }

        {
            let mut active = self.active.lock();
            if let Some(call) = active.as_mut().filter(|c| c.info.call_id == call_id) {
                call.info.muted = muted;
            }
        }
        debug!(call_id = %call_id, muted, "Mute toggled");
        self.emit_status();
        Ok(muted)
    }

    pub fn is_muted(&self) -> bool {
        self.active.lock().as_ref().map(|call| call.info.muted).unwrap_or(false)
    }

    /// Send DTMF digits on the active call
    pub async fn send_digits(&self, digits: &str) -> ClientResult<()> {
        if !is_dtmf(digits) {
            return Err(ClientError::InvalidConfiguration {
                field: "digits".to_string(),
                reason: format!("'{digits}' is not a DTMF sequence"),
            });
        }
        let carrier_call = {
            let active = self.active.lock();
            let call = active.as_ref().ok_or(ClientError::NoActiveCall)?;
            call.carrier_call.clone()
        };

        match carrier_call {
            Some(call) => {
                call.send_digits(digits).await?;
                debug!(call_id = %call.id(), digits, "Sent digits");
            }
            None => debug!("Peer calls carry no DTMF, ignoring digits"),
        }
        Ok(())
    }

    /// Put the active call on hold or resume it
    pub async fn hold(&self, on_hold: bool) -> ClientResult<()> {
        let (call_id, mode, carrier_call) = {
            let active = self.active.lock();
            let call = active.as_ref().ok_or(ClientError::NoActiveCall)?;
            (call.info.call_id.clone(), call.info.mode, call.carrier_call.clone())
        };

        let Some(carrier_call) = carrier_call else {
            debug!(call_id = %call_id, "Hold is not supported in peer mode, ignoring");
            return Ok(());
        };
        carrier_call.hold(on_hold).await?;

        let state = if on_hold { CallState::OnHold } else { CallState::Connected };
        {
            let mut active = self.active.lock();
            if let Some(call) = active.as_mut().filter(|c| c.info.call_id == call_id) {
                call.info.on_hold = on_hold;
                call.info.state = state;
            }
        }
        info!(call_id = %call_id, on_hold, "Hold changed");
        self.emit_call_state(&call_id, state, mode);
        Ok(())
    }

    /// Mode of the active call, or `CallMode::None`
    pub fn active_mode(&self) -> CallMode {
        self.active.lock().as_ref().map(|call| call.info.mode).unwrap_or(CallMode::None)
    }
}
