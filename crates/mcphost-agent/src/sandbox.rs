use std::{io, path::PathBuf};

use crate::server_config::{ResourceLimits, ServerConfig};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub cpu_seconds: u64,
    pub pids_limit: u64,
}

impl SandboxLimits {
    pub fn from_resource_limits(limits: &ResourceLimits) -> Self {
        Self {
            memory_bytes: limits.memory_mb.saturating_mul(1024 * 1024),
            cpu_seconds: limits.cpu_seconds,
            pids_limit: limits.max_processes,
        }
    }

    pub fn summary(&self) -> String {
        let mem_mb = if self.memory_bytes == 0 {
            "unlimited".to_string()
        } else {
            format!("{}MiB", self.memory_bytes / (1024 * 1024))
        };
        let cpu = if self.cpu_seconds == 0 {
            "unlimited".to_string()
        } else {
            format!("{}s", self.cpu_seconds)
        };
        let pids = if self.pids_limit == 0 {
            "unlimited".to_string()
        } else {
            self.pids_limit.to_string()
        };

        format!("mem={mem_mb} cpu={cpu} pids={pids}")
    }

    // Runs in the forked child before exec. Only async-signal-safe calls here.
    pub fn apply_pre_exec(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
                let mut cur = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if unsafe { libc::getrlimit(resource, &mut cur) } == -1 {
                    return Err(io::Error::last_os_error());
                }
                // Never try to raise the hard limit; an unprivileged child may only lower it.
                let limit = (limit as libc::rlim_t).min(cur.rlim_max);
                let lim = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                let rc = unsafe { libc::setrlimit(resource, &lim) };
                if rc == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            set_rlimit(libc::RLIMIT_CORE, 0)?;

            if self.memory_bytes > 0 {
                set_rlimit(libc::RLIMIT_AS, self.memory_bytes)?;
            }
            if self.cpu_seconds > 0 {
                set_rlimit(libc::RLIMIT_CPU, self.cpu_seconds)?;
            }
            if self.pids_limit > 0 {
                set_rlimit(libc::RLIMIT_NPROC, self.pids_limit)?;
            }

            // The child tree cannot regain privileges through setuid binaries.
            let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

impl RunAs {
    // Runs in the forked child before exec: supplementary groups, then gid, then uid.
    pub fn apply_pre_exec(&self) -> io::Result<()> {
        #[cfg(unix)]
        unsafe {
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(self.gid as libc::gid_t) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(self.uid as libc::uid_t) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn current_euid() -> u32 {
    unsafe { libc::geteuid() as u32 }
}

#[cfg(not(unix))]
fn current_euid() -> u32 {
    u32::MAX
}

#[cfg(unix)]
pub fn lookup_user(user: &str) -> io::Result<RunAs> {
    use std::ffi::CString;

    let user = user.trim();
    if let Some((uid, gid)) = user.split_once(':')
        && let (Ok(uid), Ok(gid)) = (uid.parse::<u32>(), gid.parse::<u32>())
    {
        return Ok(RunAs { uid, gid });
    }
    if let Ok(uid) = user.parse::<u32>() {
        return Ok(RunAs { uid, gid: uid });
    }

    let c = CString::new(user)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user contains NUL"))?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            c.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown user {user:?}"),
        ));
    }
    Ok(RunAs {
        uid: pwd.pw_uid as u32,
        gid: pwd.pw_gid as u32,
    })
}

#[cfg(not(unix))]
pub fn lookup_user(_user: &str) -> io::Result<RunAs> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "privilege drop is only supported on unix",
    ))
}

#[derive(Clone, Debug)]
pub struct SandboxLaunch {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub limits: Option<SandboxLimits>,
    pub run_as: Option<RunAs>,
    warnings: Vec<String>,
}

impl SandboxLaunch {
    pub fn summary(&self) -> String {
        let limits = self
            .limits
            .as_ref()
            .map(SandboxLimits::summary)
            .unwrap_or_else(|| "limits=off".to_string());
        match self.run_as {
            Some(r) => format!("{limits} uid={} gid={}", r.uid, r.gid),
            None => format!("{limits} uid=inherit"),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn apply_pre_exec(&self) -> io::Result<()> {
        if let Some(run_as) = &self.run_as {
            run_as.apply_pre_exec()?;
        }
        if let Some(limits) = &self.limits {
            limits.apply_pre_exec()?;
        }
        Ok(())
    }
}

pub fn prepare_launch(config: &ServerConfig) -> anyhow::Result<SandboxLaunch> {
    let mut warnings = Vec::<String>::new();
    let (exec, args) = config
        .command
        .split_first()
        .map(|(e, a)| (e.clone(), a.to_vec()))
        .ok_or_else(|| anyhow::anyhow!("command must be non-empty"))?;

    if !config.sandboxed {
        return Ok(SandboxLaunch {
            exec,
            args,
            cwd: config.working_dir.clone(),
            limits: None,
            run_as: None,
            warnings,
        });
    }

    let mut run_as = None;
    let wants_root = matches!(config.user.as_str(), "root" | "0" | "0:0");
    if current_euid() == 0 && !wants_root {
        let r = lookup_user(&config.user)
            .map_err(|e| anyhow::anyhow!("resolve sandbox user {:?}: {e}", config.user))?;
        if r.uid != 0 {
            run_as = Some(r);
        }
    } else if !wants_root {
        warnings.push(format!(
            "host is not running as root; child keeps the host uid instead of {:?}",
            config.user
        ));
    }

    Ok(SandboxLaunch {
        exec,
        args,
        cwd: config.working_dir.clone(),
        limits: Some(SandboxLimits::from_resource_limits(&config.resource_limits)),
        run_as,
        warnings,
    })
}
