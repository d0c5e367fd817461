//! Button capability boundary
//!
//! Devices wired through FTDI or GPIO expose physical buttons the
//! switchboard can actuate while expecting on output. Implementations live
//! with the device integration; the switchboard only validates names and
//! sequences press/release around its expect window.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A set of actuatable device buttons.
#[async_trait]
pub trait Button: Send + Sync {
    /// Returns true if `button` is a button this implementation can actuate.
    fn is_valid(&self, button: &str) -> bool;

    /// Returns the names of all actuatable buttons.
    fn valid_buttons(&self) -> Vec<String>;

    /// Presses `button`, then waits `wait` before returning.
    async fn press(&self, button: &str, wait: Duration) -> Result<()>;

    /// Releases `button`.
    async fn release(&self, button: &str) -> Result<()>;

    /// Presses and releases `button`, holding it for `duration`.
    async fn click(&self, button: &str, duration: Duration) -> Result<()> {
        self.press(button, duration).await?;
        self.release(button).await
    }

    /// Releases held buttons and frees any underlying handles.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
