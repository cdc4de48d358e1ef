use anyhow::Result;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::election::Role;

#[derive(Debug, Serialize)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Serialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// The final server command line. The launched process reads the election
/// outcome from `PRIMARY_WORKER`, not from argv, so secondaries run the
/// identical command.
pub fn plan(
    server: &ServerConfig,
    bind_host: &str,
    port: u16,
    workers: usize,
    role: Role,
) -> LaunchPlan {
    let mut args = server.args.clone();
    args.push("--bind".to_string());
    args.push(format!("{bind_host}:{port}"));
    args.push("--workers".to_string());
    args.push(workers.to_string());
    args.push("--timeout".to_string());
    args.push(server.timeout_secs.to_string());
    args.push("--keep-alive".to_string());
    args.push(server.keepalive_secs.to_string());

    let env = vec![
        EnvVar {
            name: "PRIMARY_WORKER".to_string(),
            value: if role.is_primary() { "1" } else { "0" }.to_string(),
        },
        EnvVar {
            name: "WEB_CONCURRENCY".to_string(),
            value: workers.to_string(),
        },
        EnvVar {
            name: "PORT".to_string(),
            value: port.to_string(),
        },
    ];

    LaunchPlan {
        program: server.program.clone(),
        args,
        env,
    }
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

/// Replace the current process image with the server command so that
/// process-manager signals route directly to it.
pub fn exec(plan: &LaunchPlan) -> Result<std::process::ExitCode> {
    let mut cmd = std::process::Command::new(&plan.program);
    cmd.args(&plan.args);
    for var in &plan.env {
        cmd.env(&var.name, &var.value);
    }
    cmd.stdin(std::process::Stdio::inherit());
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        let err = cmd.exec();
        anyhow::bail!("exec {} failed: {err}", plan.program);
    }
    #[cfg(not(unix))]
    {
        use anyhow::Context as _;
        let status = cmd
            .status()
            .with_context(|| format!("spawn {}", plan.program))?;
        if let Some(code) = status.code() {
            return Ok(std::process::ExitCode::from(
                u8::try_from(code).unwrap_or(1),
            ));
        }
        Ok(std::process::ExitCode::from(1))
    }
}
