//! Prompts carried by polling triggers.
//!
//! A trigger fires a cheap polling turn that peeks for work and, only when
//! something is pending, claims it and hands the full work prompt to a
//! worker session.

/// CLI binary agents use to talk to the daemon.
pub const CLI_BIN: &str = "hivectl";

/// Instructions for the worker session that executes a claimed step.
pub fn work_prompt(workflow_id: &str, role: &str) -> String {
    let agent = format!("{workflow_id}_{role}");
    format!(
        r#"You are a hive workflow agent ({agent}). Execute the claimed step below.

The claimed step JSON has the shape {{"step_id": "...", "run_id": "...", "input": "..."}}.
Keep the step_id: it is required to report the result.
The "input" field holds fully resolved instructions. Do the work it describes.

Report results as KEY: value lines, for example:
```
cat <<'HIVE_EOF' > /tmp/hive-step-output.txt
STATUS: done
CHANGES: what you changed
TESTS: what you ran
HIVE_EOF
{CLI_BIN} step complete "<step_id>" < /tmp/hive-step-output.txt
```

If the work failed:
```
{CLI_BIN} step fail "<step_id>" "what went wrong"
```

Always finish with step complete or step fail. A session that ends without
reporting leaves the step running until it is reclaimed as stale."#
    )
}

/// Message sent by a polling trigger.
pub fn polling_prompt(workflow_id: &str, role: &str, work_model: Option<&str>) -> String {
    let agent = format!("{workflow_id}_{role}");
    let model = work_model.unwrap_or("default");
    let work = work_prompt(workflow_id, role);
    format!(
        r#"1. Check for pending work without side effects:
```
{CLI_BIN} step peek "{agent}"
```
If the output is NO_WORK, reply HEARTBEAT_OK and stop. Do not claim.

2. On HAS_WORK, claim the step:
```
{CLI_BIN} step claim "{agent}"
```
If the output is NO_WORK, reply HEARTBEAT_OK and stop.

3. Spawn a worker session with agent "{agent}" and model "{model}". Its task is
the work prompt below followed by "CLAIMED STEP JSON:" and the exact claim output.

---START WORK PROMPT---
{work}
---END WORK PROMPT---

Reply with a one-line summary of what you spawned."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_prompt_targets_scoped_agent() {
        let prompt = polling_prompt("feature-dev", "developer", Some("big"));
        assert!(prompt.contains("hivectl step peek \"feature-dev_developer\""));
        assert!(prompt.contains("hivectl step claim \"feature-dev_developer\""));
        assert!(prompt.contains("model \"big\""));
        assert!(prompt.contains("---START WORK PROMPT---"));
    }

    #[test]
    fn polling_prompt_defaults_model() {
        let prompt = polling_prompt("wf", "a", None);
        assert!(prompt.contains("model \"default\""));
    }

    #[test]
    fn work_prompt_explains_reporting() {
        let prompt = work_prompt("wf", "a");
        assert!(prompt.contains("hivectl step complete"));
        assert!(prompt.contains("hivectl step fail"));
        assert!(prompt.contains("{\"step_id\""));
    }
}
