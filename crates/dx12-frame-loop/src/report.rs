use crate::error::ConfigError;
use crate::error::FrameError;
use crate::error::SetupError;
use crate::error::SyncError;

pub type AppResult<T, E = AppReport> = core::result::Result<T, E>;

/// Error returned from `main`. Wraps an [`eyre::Report`] so library and
/// native errors convert with `?`.
pub struct AppReport {
    inner: eyre::Report,
}

impl AppReport {
    pub fn into_inner(self) -> eyre::Report {
        self.inner
    }
}

impl From<eyre::Report> for AppReport {
    fn from(report: eyre::Report) -> Self {
        Self { inner: report }
    }
}

impl From<SetupError> for AppReport {
    fn from(error: SetupError) -> Self {
        Self {
            inner: eyre::Report::new(error),
        }
    }
}

impl From<FrameError> for AppReport {
    fn from(error: FrameError) -> Self {
        Self {
            inner: eyre::Report::new(error),
        }
    }
}

impl From<SyncError> for AppReport {
    fn from(error: SyncError) -> Self {
        Self {
            inner: eyre::Report::new(error),
        }
    }
}

impl From<ConfigError> for AppReport {
    fn from(error: ConfigError) -> Self {
        Self {
            inner: eyre::Report::new(error),
        }
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for AppReport {
    fn from(error: windows::core::Error) -> Self {
        // message only, its Debug is the raw struct
        Self {
            inner: eyre::eyre!("{error}"),
        }
    }
}

impl std::fmt::Display for AppReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.inner, f)
    }
}

impl std::fmt::Debug for AppReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}
