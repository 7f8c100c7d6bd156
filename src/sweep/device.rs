//! Device under test control

use anyhow::Result;

/// Applies one parameter setting to the device before a sweep point
pub trait DeviceControl {
    fn apply(&mut self, parameter: &str, value: i64) -> Result<()>;

    fn name(&self) -> &str {
        "device"
    }
}

/// Device that accepts every setting and only remembers the last one
#[derive(Debug, Default)]
pub struct NullDevice {
    pub last: Option<(String, i64)>,
}

impl DeviceControl for NullDevice {
    fn apply(&mut self, parameter: &str, value: i64) -> Result<()> {
        self.last = Some((parameter.to_string(), value));
        Ok(())
    }

    fn name(&self) -> &str {
        "null device"
    }
}
