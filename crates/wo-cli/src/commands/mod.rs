pub mod batch;
pub mod health;
pub mod lock;
pub mod plan;
pub mod task;

use serde::Serialize;
use serde_json::json;
use wo_core::OperatorError;

/// `Ok(false)` means the command ran but reported failure (exit status 1).
pub type Outcome = anyhow::Result<bool>;

/// Chooses between the JSON and the human-readable rendering of a result.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Print `value` as pretty JSON, or hand it to `human` for a text summary.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

/// Print a failure. Structured errors keep their code, hint and recovery
/// options; anything else is shown with its cause chain.
pub fn report_error(err: &anyhow::Error, out: Output) {
    match err.downcast_ref::<OperatorError>() {
        Some(op) if out.json => {
            println!("{}", json!({ "success": false, "error": op }));
        }
        Some(op) => print_operator_error(op),
        None if out.json => {
            println!(
                "{}",
                json!({ "success": false, "error": { "message": format!("{err:#}") } })
            );
        }
        None => eprintln!("error: {err:#}"),
    }
}

pub fn print_operator_error(err: &OperatorError) {
    eprintln!("error: {}", err.message);
    if let Some(hint) = &err.hint {
        eprintln!("  hint: {hint}");
    }
    if !err.recovery_options.is_empty() {
        eprintln!("  recovery:");
        for (i, option) in err.recovery_options.iter().enumerate() {
            eprintln!("    {}. {option}", i + 1);
        }
    }
    if err.code.is_precondition() {
        eprintln!("  nothing was changed; retry once this is fixed");
    }
    eprintln!("  code: {}", err.code);
}

/// `"a, b, c"`, or `"-"` for an empty list.
pub fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
