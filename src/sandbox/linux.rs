use super::child::SANDBOX_ARG0;
use super::policy::{NetworkPolicy, SandboxLevel, SandboxPolicy};
use nix::libc;

/// Apply Linux sandbox enforcement: NO_NEW_PRIVS, then Landlock, then seccomp.
///
/// seccomp must be last: it blocks syscalls that Landlock setup requires.
pub fn apply_sandbox(policy: &SandboxPolicy) -> Result<(), String> {
    set_no_new_privs()?;

    // Standard and above: filesystem confinement to the workspace.
    if policy.level >= SandboxLevel::Standard
        && let Err(e) = apply_landlock(policy)
    {
        eprintln!("{}: landlock not applied: {}", SANDBOX_ARG0, e);
    }

    if policy.network == NetworkPolicy::Deny
        && let Err(e) = apply_seccomp_network_deny()
    {
        eprintln!("{}: seccomp not applied: {}", SANDBOX_ARG0, e);
    }

    Ok(())
}

fn set_no_new_privs() -> Result<(), String> {
    // prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0)
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Apply Landlock filesystem rules.
///
/// Best-effort ABI negotiation (V5 down to V1): rules degrade on older kernels.
fn apply_landlock(policy: &SandboxPolicy) -> Result<(), String> {
    use landlock::{
        Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
        RulesetStatus, ABI,
    };

    let abi = ABI::V5;

    let read_access = AccessFs::from_read(abi);
    // Includes Truncate on V3+: without it `open(.., O_TRUNC)` fails in the workspace.
    let write_access = AccessFs::from_all(abi);

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    for path in &policy.read_only_paths {
        if let Ok(fd) = PathFd::new(path) {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, read_access));
        }
    }

    let writable = std::iter::once(&policy.workspace_path).chain(&policy.extra_write_paths);
    for path in writable {
        if let Ok(fd) = PathFd::new(path) {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, write_access));
        }
    }

    // deny_paths get no rule: once handled, every unlisted path is denied.

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    // Partial enforcement (older ABI) stays silent: stderr belongs to the program.
    match status.ruleset {
        RulesetStatus::FullyEnforced | RulesetStatus::PartiallyEnforced => Ok(()),
        RulesetStatus::NotEnforced => Err("Landlock not enforced by kernel".to_string()),
    }
}

/// Syscalls answered with EPERM when the network is denied.
const NETWORK_SYSCALLS: [i64; 13] = [
    libc::SYS_socket,
    libc::SYS_connect,
    libc::SYS_accept,
    libc::SYS_accept4,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_sendto,
    libc::SYS_sendmsg,
    libc::SYS_sendmmsg,
    libc::SYS_recvfrom,
    libc::SYS_recvmsg,
    libc::SYS_recvmmsg,
    libc::SYS_ptrace,
];

/// Apply seccomp-bpf filter that denies network-related syscalls with EPERM.
fn apply_seccomp_network_deny() -> Result<(), String> {
    let bpf = network_deny_filter()?;
    seccompiler::apply_filter(&bpf).map_err(|e| format!("seccomp apply_filter: {}", e))?;
    Ok(())
}

fn network_deny_filter() -> Result<seccompiler::BpfProgram, String> {
    use seccompiler::{SeccompAction, SeccompFilter, SeccompRule, TargetArch};
    use std::collections::BTreeMap;

    // An empty rule list matches the syscall unconditionally.
    let rules: BTreeMap<i64, Vec<SeccompRule>> = NETWORK_SYSCALLS
        .into_iter()
        .map(|syscall| (syscall, Vec::new()))
        .collect();

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp unsupported arch: {}", e))?;

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch,
    )
    .map_err(|e| format!("seccomp filter creation: {}", e))?;

    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp BPF compilation: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Applying a filter would restrict the test process itself; only
    // construction is checked here.

    #[test]
    fn test_network_syscalls_are_valid() {
        for syscall in NETWORK_SYSCALLS {
            assert!(syscall > 0, "Invalid syscall number: {}", syscall);
        }
    }

    #[test]
    fn test_network_deny_filter_compiles() {
        let bpf = network_deny_filter().unwrap();
        // One comparison per denied syscall plus the arch check and default action.
        assert!(bpf.len() > NETWORK_SYSCALLS.len());
    }
}
