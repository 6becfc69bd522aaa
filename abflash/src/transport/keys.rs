//! SSH key provisioning so the device can reach the image host without a
//! password.

use std::time::Duration;

use log::info;

use crate::console::Console;
use crate::error::{Error, Result};
use crate::shell::{Shell, shell_quote};
use crate::transport::SshTarget;
use crate::transport::interactive;

/// Dropbear private key on the device.
pub const DROPBEAR_KEY: &str = "~/.ssh/id_dropbear";

/// Exported OpenSSH-format public key.
pub const DROPBEAR_PUBLIC_KEY: &str = "~/.ssh/id_dropbear.pub";

/// Key generation is slow on small boards.
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Make sure the device has a Dropbear key and that `target` accepts it.
///
/// The key is generated only when missing. The public key is appended to the
/// image host's `authorized_keys` through interactive SSH, so the password
/// configured on `target` is used one last time here.
pub fn provision_keys<C: Console>(
    shell: &mut Shell<C>,
    target: &SshTarget,
    timeout: Duration,
) -> Result<()> {
    provision(shell, target, timeout).map_err(|e| match e {
        Error::KeyProvisioning(_) => e,
        other => Error::KeyProvisioning(other.to_string()),
    })
}

fn provision<C: Console>(shell: &mut Shell<C>, target: &SshTarget, timeout: Duration) -> Result<()> {
    shell.run("mkdir -p ~/.ssh", timeout)?;

    let existing = shell.run(
        &format!("test -f {DROPBEAR_KEY} && echo KEY_EXISTS || echo KEY_MISSING"),
        timeout,
    )?;
    if existing.lines().any(|l| l.trim() == "KEY_EXISTS") {
        info!("Reusing existing Dropbear key");
    } else {
        info!("Generating Dropbear RSA key...");
        let out = shell.run(
            &format!("dropbearkey -t rsa -f {DROPBEAR_KEY} -s 2048 2>&1"),
            KEYGEN_TIMEOUT,
        )?;
        let lower = out.to_lowercase();
        if lower.contains("not found") || lower.contains("error") {
            return Err(Error::KeyProvisioning(format!("dropbearkey failed: {out}")));
        }
    }

    shell.run(
        &format!("dropbearkey -y -f {DROPBEAR_KEY} | grep '^ssh-rsa' > {DROPBEAR_PUBLIC_KEY}"),
        timeout,
    )?;
    let public_key = shell.run(&format!("cat {DROPBEAR_PUBLIC_KEY}"), timeout)?;
    if !public_key.trim_start().starts_with("ssh-rsa ") {
        return Err(Error::KeyProvisioning(format!(
            "no public key exported: {public_key}"
        )));
    }

    info!("Copying public key to {}...", target.destination());
    let remote = "mkdir -p ~/.ssh && cat >> ~/.ssh/authorized_keys && chmod 600 ~/.ssh/authorized_keys";
    let line = format!(
        "cat {DROPBEAR_PUBLIC_KEY} | ssh {} {}",
        target.destination(),
        shell_quote(remote)
    );
    interactive::drive(shell, target, &line, timeout)?;

    info!("SSH key installed on {}", target.host);
    Ok(())
}
