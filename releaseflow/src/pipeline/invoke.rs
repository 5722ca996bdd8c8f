//! Bounded external invocations.

use crate::cancellation::CancellationToken;
use crate::errors::ToolError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs one external invocation under a timeout, racing run cancellation.
///
/// An elapsed timeout is reported as [`ToolError::TimedOut`], which callers
/// fold into the same failure kind as any other tool error. Cancellation
/// drops the invocation future; it must therefore only wrap calls that do
/// not write bundles or hosted assets.
///
/// # Errors
///
/// Returns the tool's own error, `TimedOut` or `Cancelled`.
pub async fn invoke<T, F>(
    tool: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    invocation: F,
) -> Result<T, ToolError>
where
    F: Future<Output = Result<T, ToolError>>,
{
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled {
            tool: tool.to_string(),
            reason: cancel.reason().unwrap_or_default(),
        });
    }

    debug!(tool, timeout_secs = timeout.as_secs_f64(), "invoking tool");
    tokio::select! {
        result = tokio::time::timeout(timeout, invocation) => match result {
            Ok(inner) => inner,
            Err(_) => {
                warn!(tool, timeout_secs = timeout.as_secs_f64(), "tool timed out");
                Err(ToolError::TimedOut {
                    tool: tool.to_string(),
                    timeout,
                })
            }
        },
        () = cancel.cancelled() => Err(ToolError::Cancelled {
            tool: tool.to_string(),
            reason: cancel.reason().unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_invoke_passes_result_through() {
        let token = CancellationToken::new();
        let ok = invoke("cargo", Duration::from_secs(1), &token, async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<(), _> = invoke("cargo", Duration::from_secs(1), &token, async {
            Err(ToolError::failed("cargo", "linker error"))
        })
        .await;
        assert_eq!(err, Err(ToolError::failed("cargo", "linker error")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let token = CancellationToken::new();
        let result: Result<(), _> = invoke("lipo", Duration::from_secs(5), &token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(ToolError::TimedOut {
                tool: "lipo".to_string(),
                timeout: Duration::from_secs(5),
            })
        );
    }

    #[tokio::test]
    async fn test_invoke_observes_cancellation() {
        let token = Arc::new(CancellationToken::new());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("tag superseded");
        });

        let result: Result<(), _> = invoke("cargo", Duration::from_secs(30), &token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("tag superseded"));
    }

    #[tokio::test]
    async fn test_invoke_refuses_after_cancel() {
        let token = CancellationToken::new();
        token.cancel("operator abort");
        let result = invoke("cargo", Duration::from_secs(1), &token, async { Ok(1) }).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
