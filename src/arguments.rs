/// Centralized argument handling for SwabBot
///
/// Consolidates command-line argument parsing and per-module debug flag
/// checking so services and the logger share one source of truth.
use once_cell::sync::Lazy;
use std::env;
use std::sync::Mutex;

/// Global command-line arguments storage
pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Sets the global command-line arguments
/// Used by tests to override the default env::args() collection
pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Gets a copy of the current command-line arguments
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => env::args().collect(),
    }
}

/// Checks if a specific argument is present in the command line
pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Gets the value of a command-line argument that follows a flag
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    for (i, arg) in args.iter().enumerate() {
        if arg == flag {
            return args.get(i + 1).cloned();
        }
    }
    None
}

pub fn is_verbose_enabled() -> bool {
    has_arg("--verbose")
}

pub fn is_debug_ledger_enabled() -> bool {
    has_arg("--debug-ledger")
}

pub fn is_debug_webhook_enabled() -> bool {
    has_arg("--debug-webhook")
}

pub fn is_debug_poller_enabled() -> bool {
    has_arg("--debug-poller")
}

pub fn is_debug_reconcile_enabled() -> bool {
    has_arg("--debug-reconcile")
}

pub fn is_debug_budget_enabled() -> bool {
    has_arg("--debug-budget")
}

pub fn is_debug_oracle_enabled() -> bool {
    has_arg("--debug-oracle")
}

pub fn is_debug_gate_enabled() -> bool {
    has_arg("--debug-gate")
}

/// Check if any debug flag matching the given module key is enabled
pub fn is_debug_enabled_for(module_key: &str) -> bool {
    has_arg(&format!("--debug-{}", module_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value_lookup() {
        set_cmd_args(vec![
            "swabbot".to_string(),
            "--config".to_string(),
            "custom.json".to_string(),
            "--debug-ledger".to_string(),
        ]);

        assert_eq!(get_arg_value("--config"), Some("custom.json".to_string()));
        assert_eq!(get_arg_value("--missing"), None);
        assert!(has_arg("--debug-ledger"));
        assert!(is_debug_enabled_for("ledger"));
        assert!(!is_debug_enabled_for("poller"));
    }
}
