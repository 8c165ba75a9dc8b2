use super::{EXIT_FAILURE, EXIT_SUCCESS};
use brig_runtime::{check_prereqs, find_runtime, resolve_strategy};
use brig_schema::ProviderConfig;
use std::path::Path;

pub fn run(config: &ProviderConfig, build_root: &Path) -> u8 {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let missing = check_prereqs(config);
    if missing.is_empty() {
        checks.push(Check::pass("Host prerequisites satisfied"));
    } else {
        all_pass = false;
        for m in &missing {
            checks.push(Check::fail(&format!(
                "{} missing: needed for {} (install: {})",
                m.name, m.purpose, m.install_hint
            )));
        }
    }

    if let Ok(binary) = find_runtime(config.runtime.as_deref()) {
        checks.push(Check::info(&format!("Runtime: {}", binary.display())));
    }

    match resolve_strategy(config.rootfs) {
        Ok(kind) => checks.push(Check::info(&format!("Rootfs strategy: {kind:?}"))),
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail(&format!("Rootfs strategy: {e}")));
        }
    }

    if build_root.is_dir() {
        checks.push(Check::pass(&format!(
            "Build root {} exists",
            build_root.display()
        )));
    } else {
        checks.push(Check::info(&format!(
            "Build root {} not initialized (created on first pull)",
            build_root.display()
        )));
    }

    println!("brig doctor\n");
    for check in &checks {
        println!("  {} {}", check.status.icon(), check.message);
    }
    println!();
    if all_pass {
        println!("All checks passed.");
        EXIT_SUCCESS
    } else {
        println!("Some checks failed. See above for details.");
        EXIT_FAILURE
    }
}

#[derive(Debug, Clone, Copy)]
enum Status {
    Pass,
    Fail,
    Info,
}

impl Status {
    fn icon(self) -> &'static str {
        match self {
            Status::Pass => "✓",
            Status::Fail => "✗",
            Status::Info => "ℹ",
        }
    }
}

struct Check {
    status: Status,
    message: String,
}

impl Check {
    fn pass(message: &str) -> Self {
        Self {
            status: Status::Pass,
            message: message.to_owned(),
        }
    }

    fn fail(message: &str) -> Self {
        Self {
            status: Status::Fail,
            message: message.to_owned(),
        }
    }

    fn info(message: &str) -> Self {
        Self {
            status: Status::Info,
            message: message.to_owned(),
        }
    }
}
