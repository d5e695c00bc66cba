//! Frame Capture Layer
//!
//! Produces normalized raster frames either by screenshotting a virtual
//! display (scrot subprocess) or by decoding uploaded image bytes. Screenshot
//! tools are flaky under cold display start, so display captures run under a
//! bounded retry policy with backoff.

pub mod frame;

use std::future::Future;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CaptureSettings, RetryPolicy};
use crate::display::DisplayHandle;
use crate::error::PipelineError;
use frame::{Frame, FrameSource};

/// Frame capturer for both the display and upload paths
pub struct FrameCapturer {
    settings: CaptureSettings,
}

impl FrameCapturer {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }

    /// Screenshot the given display, retrying per the configured policy.
    /// The error side carries the attempt number that produced the final
    /// failure.
    ///
    /// Captures against one display are serialized via the handle's capture
    /// permit so concurrent requests never race the screenshot tool.
    pub async fn capture_display(
        &self,
        handle: &DisplayHandle,
        cancel: &CancellationToken,
    ) -> Result<Frame, (u32, PipelineError)> {
        let _permit = handle.capture_permit().await;

        with_retry(&self.settings.retry, cancel, |attempt| {
            self.attempt_screenshot(handle, attempt, cancel)
        })
        .await
    }

    /// Decode uploaded image bytes into a frame (no display involved)
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Frame, PipelineError> {
        Frame::from_bytes(bytes, FrameSource::Upload)
    }

    async fn attempt_screenshot(
        &self,
        handle: &DisplayHandle,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Frame, PipelineError> {
        let dir = tempfile::tempdir()?;
        let out_path = dir.path().join("frame.png");
        let timeout = Duration::from_millis(self.settings.timeout_ms);

        debug!(
            display = handle.display(),
            attempt,
            tool = %self.settings.tool,
            "capturing frame"
        );

        let mut command = Command::new(&self.settings.tool);
        command
            .env("DISPLAY", handle.display_env())
            .arg("--overwrite")
            .arg(&out_path)
            .kill_on_drop(true);

        let run = async {
            match tokio::time::timeout(timeout, command.output()).await {
                Ok(output) => output.map_err(PipelineError::from),
                Err(_) => Err(PipelineError::CaptureTimeout {
                    elapsed_ms: self.settings.timeout_ms,
                }),
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            output = run => output?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::CaptureEmpty(format!(
                "screenshot tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::read(&out_path).await.map_err(|e| {
            PipelineError::CaptureEmpty(format!("screenshot output missing: {}", e))
        })?;

        Frame::from_bytes(&bytes, FrameSource::VirtualDisplay)
    }
}

/// Run `op` up to the policy's attempt budget, backing off between retryable
/// failures. Non-retryable errors and cancellation surface immediately.
/// Failures are returned with the 1-based attempt number that produced them.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, (u32, PipelineError)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err((attempt, PipelineError::Cancelled));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts() => {
                let delay = policy.backoff(attempt);
                warn!(attempt, "retryable failure, backing off {:?}: {}", delay, e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err((attempt, PipelineError::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err((attempt, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        // Two timeouts, then success on the third attempt
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(), &cancel, |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(PipelineError::CaptureTimeout { elapsed_ms: 10 })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = with_retry(&fast_policy(), &cancel, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::CaptureTimeout { elapsed_ms: 10 })
            }
        })
        .await;

        let (attempt, err) = result.unwrap_err();
        assert!(matches!(err, PipelineError::CaptureTimeout { .. }));
        // max_retries = 2 means exactly 3 attempts, and the error reports
        // the attempt that produced it
        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = with_retry(&fast_policy(), &cancel, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::OcrEngine("deterministic".to_string()))
            }
        })
        .await;

        let (attempt, err) = result.unwrap_err();
        assert!(matches!(err, PipelineError::OcrEngine(_)));
        assert_eq!(attempt, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> =
            with_retry(&fast_policy(), &cancel, |_| async { Ok(()) }).await;

        assert!(matches!(result.unwrap_err(), (1, PipelineError::Cancelled)));
    }

    #[test]
    fn test_upload_path_decodes_bytes() {
        let capturer = FrameCapturer::new(CaptureSettings::default());
        let img = image::RgbaImage::from_pixel(5, 5, image::Rgba([0, 0, 0, 255]));
        let mut png = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();

        let frame = capturer.from_bytes(png.get_ref()).unwrap();
        assert_eq!(frame.dimensions(), (5, 5));
        assert_eq!(frame.source, FrameSource::Upload);
    }

    #[test]
    fn test_upload_path_rejects_garbage() {
        let capturer = FrameCapturer::new(CaptureSettings::default());
        let err = capturer.from_bytes(b"\x00\x01garbage").unwrap_err();
        assert!(matches!(err, PipelineError::CaptureEmpty(_)));
    }
}
