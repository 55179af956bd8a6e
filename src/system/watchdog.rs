/// Liveness signal fed from the stepping loop and from any bounded wait.
pub trait Watchdog {
    fn feed(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&self) {}
}

/// Resets the ESP-IDF task watchdog for the calling task.
#[cfg(target_os = "espidf")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskWatchdog;

#[cfg(target_os = "espidf")]
impl TaskWatchdog {
    /// Subscribes the current task; call once from the task that will step the session.
    pub fn subscribe_current_task() -> Result<Self, esp_idf_svc::sys::EspError> {
        esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) })?;
        Ok(Self)
    }
}

#[cfg(target_os = "espidf")]
impl Watchdog for TaskWatchdog {
    fn feed(&self) {
        unsafe {
            esp_idf_svc::sys::esp_task_wdt_reset();
        }
    }
}
