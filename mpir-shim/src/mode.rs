//! Run-mode resolution and the options accepted by [`run`](crate::run).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How the shim relates to the launcher it drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// Spawn the launcher and act as its rendezvous server.
    Proxy,
    /// Spawn the launcher through an already-running system-level server.
    NonProxy,
    /// Bind to an already-running launcher identified by pid.
    Attach,
    /// Pick [`RunMode::Proxy`] or [`RunMode::NonProxy`] from the name of the
    /// launcher command.
    Dynamic,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunMode::Proxy => write!(f, "proxy"),
            RunMode::NonProxy => write!(f, "non-proxy"),
            RunMode::Attach => write!(f, "attach"),
            RunMode::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "proxy" => Ok(RunMode::Proxy),
            "non-proxy" | "nonproxy" => Ok(RunMode::NonProxy),
            "attach" => Ok(RunMode::Attach),
            "dynamic" => Ok(RunMode::Dynamic),
            _ => Err(format!(
                "'{s}' is not a valid run mode. Choose from [proxy, non-proxy, attach, dynamic]."
            )),
        }
    }
}

/// Options accepted by [`run`](crate::run).
#[derive(Clone, Debug)]
pub struct ShimOptions {
    /// Requested run mode.
    pub mode: RunMode,
    /// Pid of the launcher to bind to in [`RunMode::Attach`].
    pub target_pid: i32,
    /// Emit extra progress diagnostics.
    pub debug: bool,
    /// The launcher command and all of its arguments.
    pub run_args: Vec<String>,
    /// PMIx installation prefix handed to the launcher, if any.
    pub pmix_prefix: Option<PathBuf>,
}

impl Default for ShimOptions {
    fn default() -> Self {
        ShimOptions {
            mode: RunMode::Dynamic,
            target_pid: 0,
            debug: false,
            run_args: Vec::new(),
            pmix_prefix: None,
        }
    }
}

impl ShimOptions {
    /// Validate the options and collapse [`RunMode::Dynamic`] into a concrete
    /// mode.
    ///
    /// Attach mode requires a positive pid; every other mode requires a
    /// launcher command. Dynamic resolves by the launcher's basename: `prun`
    /// talks to the system server, anything else is proxied.
    pub fn resolved(mut self) -> Result<Self, Error> {
        match self.mode {
            RunMode::Attach => {
                if self.target_pid <= 0 {
                    return Err(Error::InvalidTargetPid(self.target_pid));
                }
            }
            _ => {
                if self.run_args.is_empty() {
                    return Err(Error::MissingLauncherCommand);
                }
            }
        }
        if self.mode == RunMode::Dynamic {
            self.mode = match launcher_basename(&self.run_args[0]) {
                Some("prun") => RunMode::NonProxy,
                _ => RunMode::Proxy,
            };
        }
        Ok(self)
    }
}

fn launcher_basename(arg: &str) -> Option<&str> {
    Path::new(arg).file_name()?.to_str()
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    fn dynamic(args: &[&str]) -> ShimOptions {
        ShimOptions {
            run_args: args.iter().map(|a| a.to_string()).collect(),
            ..ShimOptions::default()
        }
    }

    #[test_case(&["prun", "-n", "2", "./hi"], RunMode::NonProxy; "plain prun")]
    #[test_case(&["/opt/pmix/bin/prun", "./hi"], RunMode::NonProxy; "absolute prun")]
    #[test_case(&["mpirun", "-n", "4", "./hello"], RunMode::Proxy; "mpirun")]
    #[test_case(&["prterun", "./hello"], RunMode::Proxy; "prterun")]
    #[test_case(&["./prunner", "./hello"], RunMode::Proxy; "prun prefix does not count")]
    fn dynamic_mode_resolves_by_basename(args: &[&str], expected: RunMode) {
        let options = dynamic(args).resolved().unwrap();
        assert_eq!(options.mode, expected);
    }

    #[test]
    fn explicit_modes_survive_resolution() {
        let mut options = dynamic(&["prun", "./hi"]);
        options.mode = RunMode::Proxy;
        assert_eq!(options.resolved().unwrap().mode, RunMode::Proxy);
    }

    #[test]
    fn attach_requires_positive_pid() {
        let options = ShimOptions {
            mode: RunMode::Attach,
            ..ShimOptions::default()
        };
        assert!(matches!(
            options.resolved(),
            Err(Error::InvalidTargetPid(0))
        ));
    }

    #[test]
    fn attach_needs_no_run_args() {
        let options = ShimOptions {
            mode: RunMode::Attach,
            target_pid: 12345,
            ..ShimOptions::default()
        };
        assert_eq!(options.resolved().unwrap().mode, RunMode::Attach);
    }

    #[test]
    fn spawn_modes_require_a_command() {
        let options = ShimOptions::default();
        assert!(matches!(
            options.resolved(),
            Err(Error::MissingLauncherCommand)
        ));
    }

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [
            RunMode::Proxy,
            RunMode::NonProxy,
            RunMode::Attach,
            RunMode::Dynamic,
        ] {
            assert_eq!(mode.to_string().parse::<RunMode>().unwrap(), mode);
        }
    }
}
