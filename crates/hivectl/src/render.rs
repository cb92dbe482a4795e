//! Output rendering for hivectl.
//!
//! Formats runs, steps and stories for terminal display.

use hive_core::types::{Event, Run, Step, Story};

/// Print confirmation after starting a run.
pub fn print_run_created(run: &Run) {
    println!("Started run #{}: {}", run.run_number, run.id);
    println!("  Workflow: {}", run.workflow_id);
    println!("  Task:     {}", run.task);
    println!("  Status:   {}", run.status.as_str());
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<5}  {:<36}  {:<20}  {:<10}  {:<20}",
        "#", "ID", "WORKFLOW", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(99));

    for run in runs {
        println!(
            "{:<5}  {:<36}  {:<20}  {:<10}  {:<20}",
            run.run_number,
            run.id.0,
            truncate(&run.workflow_id, 20),
            run.status.as_str(),
            format_time(&run.created_at),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run with its steps, stories and recent events.
pub fn print_run_details(run: &Run, steps: &[Step], stories: &[Story], events: &[Event]) {
    println!("Run #{}: {}", run.run_number, run.id);
    println!();
    println!("  Workflow:  {}", run.workflow_id);
    println!("  Task:      {}", run.task);
    println!("  Status:    {}", run.status.as_str());
    if let Some(ref url) = run.notify_url {
        println!("  Notify:    {url}");
    }
    println!("  Created:   {}", format_time(&run.created_at));
    println!("  Updated:   {}", format_time(&run.updated_at));

    if !steps.is_empty() {
        println!();
        println!("  Steps:");
        println!(
            "    {:<3}  {:<16}  {:<6}  {:<8}  {:<7}  {:<30}",
            "#", "STEP", "KIND", "STATUS", "RETRY", "AGENT"
        );
        println!("    {}", "-".repeat(80));
        for step in steps {
            println!(
                "    {:<3}  {:<16}  {:<6}  {:<8}  {:<7}  {:<30}",
                step.step_index,
                truncate(&step.step_key, 16),
                step.kind.as_str(),
                step.status.as_str(),
                format!("{}/{}", step.retry_count, step.max_retries),
                truncate(&step.agent_id, 30),
            );
        }
    }

    if !stories.is_empty() {
        let done = stories
            .iter()
            .filter(|s| s.status == hive_core::StoryStatus::Done)
            .count();
        println!();
        println!("  Stories ({done}/{} done):", stories.len());
        for story in stories {
            println!(
                "    {:<10}  {:<8}  {}/{}  {}",
                truncate(&story.story_key, 10),
                story.status.as_str(),
                story.retry_count,
                story.max_retries,
                truncate(&story.title, 50),
            );
        }
    }

    if !events.is_empty() {
        println!();
        println!("  Recent events:");
        let skip = events.len().saturating_sub(10);
        for event in &events[skip..] {
            match &event.detail {
                Some(detail) => println!(
                    "    {}  {:<15}  {}",
                    format_time(&event.timestamp),
                    event.event_type,
                    truncate(detail, 60)
                ),
                None => println!(
                    "    {}  {}",
                    format_time(&event.timestamp),
                    event.event_type
                ),
            }
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Shorten to at most `max_len` characters, marking the cut with `...`.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("feature-dev", 20), "feature-dev");
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
