//! Script signing seam.
//!
//! Scripts are Authenticode-signed before they land in the template tree so
//! clients running with an `AllSigned` execution policy accept them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use soon_core::error::{CoreError, CoreResult};
use soon_core::process::{run_tool, ToolCommand, ToolError};

#[async_trait]
pub trait ScriptSigner: Send + Sync {
    /// Return the signed form of `content`. Any failure is `SigningFailed`.
    async fn sign(&self, content: &[u8]) -> CoreResult<Vec<u8>>;

    async fn ping(&self) -> CoreResult<()>;
}

/// Signs with `osslsigncode` and a PKCS#12 key.
///
/// The password, if any, is handed over through a private file with
/// `-readpass` rather than on the command line.
#[derive(Debug, Clone)]
pub struct OsslSigncodeSigner {
    program: PathBuf,
    pkcs12: PathBuf,
    password: Option<String>,
    timeout: Duration,
}

impl OsslSigncodeSigner {
    pub fn new(program: PathBuf, pkcs12: PathBuf, password: Option<String>, timeout: Duration) -> Self {
        Self {
            program,
            pkcs12,
            password,
            timeout,
        }
    }

    fn failed(context: &str, err: impl std::fmt::Display) -> CoreError {
        CoreError::SigningFailed(format!("{context}: {err}"))
    }
}

#[async_trait]
impl ScriptSigner for OsslSigncodeSigner {
    async fn sign(&self, content: &[u8]) -> CoreResult<Vec<u8>> {
        let work = tempfile::tempdir().map_err(|e| Self::failed("Cannot create work folder", e))?;
        let input = work.path().join("unsigned.ps1");
        let output = work.path().join("signed.ps1");
        tokio::fs::write(&input, content)
            .await
            .map_err(|e| Self::failed("Cannot stage script", e))?;

        let mut cmd = ToolCommand::new(&self.program, self.timeout)
            .arg("sign")
            .arg("-pkcs12")
            .arg(self.pkcs12.as_os_str());
        if let Some(password) = &self.password {
            let pass_file = work.path().join("pass");
            tokio::fs::write(&pass_file, password)
                .await
                .map_err(|e| Self::failed("Cannot stage key password", e))?;
            cmd = cmd.arg("-readpass").arg(pass_file.as_os_str());
        }
        cmd = cmd
            .arg("-in")
            .arg(input.as_os_str())
            .arg("-out")
            .arg(output.as_os_str());

        let out = match run_tool(cmd).await {
            Ok(out) => out,
            Err(ToolError::NotFound(program)) => {
                return Err(Self::failed("Signer unreachable", format!("{program} not found")))
            }
            Err(e) => return Err(Self::failed("Signer unreachable", e)),
        };
        if !out.success() {
            return Err(CoreError::SigningFailed(format!(
                "osslsigncode exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }

        let signed = tokio::fs::read(&output)
            .await
            .map_err(|e| Self::failed("Signer produced no output", e))?;
        tracing::debug!(
            unsigned_bytes = content.len(),
            signed_bytes = signed.len(),
            duration_ms = out.duration_ms,
            "Script signed"
        );
        Ok(signed)
    }

    async fn ping(&self) -> CoreResult<()> {
        tokio::fs::metadata(&self.pkcs12)
            .await
            .map_err(|e| Self::failed(&format!("Signing key {}", self.pkcs12.display()), e))?;
        let out = run_tool(ToolCommand::new(&self.program, self.timeout).arg("-v"))
            .await
            .map_err(|e| Self::failed("Signer unreachable", e))?;
        if out.success() {
            Ok(())
        } else {
            Err(CoreError::SigningFailed(format!(
                "{} -v exited with {}",
                self.program.display(),
                out.exit_code
            )))
        }
    }
}
