//! Global tick clock. Ticks are opaque monotone integers; any calendar
//! semantics live above the kernel.

use contracts::KernelError;

pub const DEFAULT_START_TICK: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalClock {
    tick: u64,
}

impl GlobalClock {
    pub fn new(start_tick: i64) -> Result<Self, KernelError> {
        if start_tick < 0 {
            return Err(KernelError::invalid_argument(format!(
                "start_tick must be >= 0, got {start_tick}"
            )));
        }
        Ok(Self {
            tick: start_tick as u64,
        })
    }

    pub fn current(&self) -> u64 {
        self.tick
    }

    pub fn advance(&mut self, step: i64) -> Result<u64, KernelError> {
        let step = validate_step(step)?;
        self.tick = self.tick.saturating_add(step);
        Ok(self.tick)
    }

    pub fn peek(&self, step: i64) -> Result<u64, KernelError> {
        let step = validate_step(step)?;
        Ok(self.tick.saturating_add(step))
    }
}

impl Default for GlobalClock {
    fn default() -> Self {
        Self {
            tick: DEFAULT_START_TICK as u64,
        }
    }
}

fn validate_step(step: i64) -> Result<u64, KernelError> {
    if step <= 0 {
        return Err(KernelError::invalid_argument(format!(
            "step must be > 0, got {step}"
        )));
    }
    Ok(step as u64)
}
