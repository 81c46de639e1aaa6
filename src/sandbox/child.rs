use super::policy::{ResourceLimits, SandboxLevel, SandboxPolicy};

/// argv[0] the process executor re-execs itself under.
pub const SANDBOX_ARG0: &str = "agentbox-sandbox";

/// Entry point for the sandbox child process.
///
/// Called when the binary detects argv[0] ends with `agentbox-sandbox`.
/// Never returns: it either execs the interpreter or exits.
///
/// argv layout:
///   argv[0] = "agentbox-sandbox"
///   argv[1] = SandboxPolicy JSON
///   argv[2] = interpreter
///   argv[3..] = interpreter arguments
pub fn sandbox_child_main() -> ! {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("{}: expected policy JSON and interpreter arguments", SANDBOX_ARG0);
        std::process::exit(1);
    }

    let policy: SandboxPolicy = match serde_json::from_str(&args[1]) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: failed to parse policy: {}", SANDBOX_ARG0, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = apply_rlimits(&policy.limits) {
        eprintln!("{}: failed to apply rlimits: {}", SANDBOX_ARG0, e);
        std::process::exit(1);
    }

    if policy.level > SandboxLevel::None
        && let Err(e) = apply_platform_sandbox(&policy)
    {
        eprintln!("{}: failed to apply sandbox: {}", SANDBOX_ARG0, e);
        std::process::exit(1);
    }

    exec_interpreter(&args[2], &args[3..]);
}

/// Lower resource limits for the current process.
///
/// Only async-signal-safe calls: also used from `pre_exec` when the
/// process backend spawns without re-exec. Hard limits are never raised.
#[cfg(unix)]
pub fn apply_rlimits(limits: &ResourceLimits) -> nix::Result<()> {
    use nix::sys::resource::Resource;

    // RLIMIT_DATA rather than RLIMIT_AS: V8 reserves address space far
    // beyond what it touches.
    lower_limit(Resource::RLIMIT_DATA, limits.max_memory_bytes)?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.max_file_size_bytes)?;
    lower_limit(Resource::RLIMIT_NOFILE, limits.max_open_files)?;
    #[cfg(target_os = "linux")]
    lower_limit(Resource::RLIMIT_NPROC, limits.max_processes as u64)?;
    Ok(())
}

#[cfg(unix)]
fn lower_limit(resource: nix::sys::resource::Resource, value: u64) -> nix::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)
}

fn apply_platform_sandbox(policy: &SandboxPolicy) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        super::linux::apply_sandbox(policy)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = policy;
        Ok(())
    }
}

/// Replace the current process with the interpreter.
fn exec_interpreter(program: &str, args: &[String]) -> ! {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(program).args(args).exec();

    // exec() only returns on error
    eprintln!("{}: failed to exec {}: {}", SANDBOX_ARG0, program, err);
    std::process::exit(127);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimits_apply_in_child() {
        use std::os::unix::process::CommandExt;

        let limits = ResourceLimits {
            max_memory_bytes: 1 << 30,
            max_file_size_bytes: 1 << 20,
            max_processes: 4096,
            max_open_files: 64,
        };
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("ulimit -n");
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits).map_err(std::io::Error::from));
        }
        let out = cmd.output().unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "64");
    }
}
