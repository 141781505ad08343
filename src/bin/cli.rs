use chrono::{Local, NaiveDate};
use std::io::{self, Write};
use std::path::Path;
use study_scheduler::{
    AuditEntry, AuditLog, AuditQuery, DailyCloseout, NewTask, PolicyStore, Rescheduler,
    SchedulerConfig, SqliteStore, StudentId, Task, TaskId, TaskLedger, TaskStatus, logging,
};

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (ci, cell) in row.iter().enumerate() {
            if cell.len() > widths[ci] {
                widths[ci] = cell.len();
            }
        }
    }

    let mut sep = String::from("+");
    for w in &widths {
        sep.push_str(&"-".repeat(*w + 2));
        sep.push('+');
    }

    let render_row = |cells: Vec<&str>| {
        let mut line = String::from("|");
        for (ci, cell) in cells.iter().enumerate() {
            line.push(' ');
            line.push_str(cell);
            line.push_str(&" ".repeat(widths[ci].saturating_sub(cell.len())));
            line.push_str(" |");
        }
        line
    };

    let mut out = String::new();
    out.push_str(&sep);
    out.push('\n');
    out.push_str(&render_row(headers.to_vec()));
    out.push('\n');
    out.push_str(&sep);
    out.push('\n');
    for row in rows {
        out.push_str(&render_row(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out.push_str(&sep);
    out.push('\n');
    out
}

fn render_tasks(tasks: &[Task]) -> String {
    let rows: Vec<Vec<String>> = tasks
        .iter()
        .map(|t| {
            vec![
                t.id.to_string(),
                t.date.to_string(),
                t.category.to_string(),
                t.title.clone(),
                if t.completed { "yes" } else { "no" }.to_string(),
                t.status.to_string(),
                t.original_date.to_string(),
            ]
        })
        .collect();
    render_table(
        &["id", "date", "category", "title", "done", "status", "original_date"],
        &rows,
    )
}

fn render_audit(entries: &[AuditEntry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.action.to_string(),
                e.task_id.map(|id| id.to_string()).unwrap_or_default(),
                e.moved_from.to_string(),
                e.moved_to.map(|d| d.to_string()).unwrap_or_default(),
                e.reason.clone(),
            ]
        })
        .collect();
    render_table(&["id", "action", "task", "from", "to", "reason"], &rows)
}

fn print_help() {
    println!(
        "Commands:\n  help                                   Show this help\n  add <student> <YYYY-MM-DD> <subject> <title...>\n                                         Assign a task\n  rest <student> <YYYY-MM-DD>            Mark a rest day\n  leave <student> <YYYY-MM-DD>           Mark a leave day\n  done <task_id>                         Mark a task completed\n  remove <task_id> <reason...>           Remove a task (audited)\n  show <student> <YYYY-MM-DD>            Show a student's tasks for a date\n  policy show <student>                  Show a student's policy\n  policy set <student> <cap> <threshold> <horizon>\n                                         Update a student's policy\n  close <student> <YYYY-MM-DD>           Close out one student's day\n  closeall <YYYY-MM-DD>                  Close out a date for every student\n  audit <student> [from] [to]            Show audit entries\n  status                                 Show trigger schedule status\n  statuses                               List task statuses\n  quit|exit                              Exit"
    );
}

fn parse_student(s: Option<&str>) -> Option<StudentId> {
    s.and_then(|v| v.parse().ok())
}

fn parse_date(s: Option<&str>) -> Option<NaiveDate> {
    s.and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
}

fn show_day(store: &SqliteStore, student: StudentId, date: NaiveDate) {
    match store.read(|repo| repo.tasks_on(student, date)) {
        Ok(tasks) => println!("{}", render_tasks(&tasks)),
        Err(e) => println!("Error: {e}"),
    }
}

fn insert(store: &SqliteStore, task: NewTask) {
    let result: Result<TaskId, _> = store.write(|repo| repo.insert_task(&task));
    match result {
        Ok(id) => println!("Task {id} added."),
        Err(e) => println!("Error: {e}"),
    }
}

fn main() {
    if let Err(e) = logging::init("warn") {
        eprintln!("{e}");
    }

    let config = match SchedulerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    let db_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.database_path.clone());

    let store = match SqliteStore::open(Path::new(&db_path)) {
        Ok(store) => store.with_busy_timeout(config.busy_timeout()),
        Err(e) => {
            eprintln!("Error opening {}: {e}", db_path.display());
            std::process::exit(2);
        }
    };
    let engine = Rescheduler::new(store).with_default_policy(config.default_policy);
    let store = engine.store();

    println!("Study Scheduler (CLI) - type 'help' for commands\n");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let mut parts = input.split_whitespace();
        let cmd = parts.next().unwrap_or("");

        match cmd {
            "help" => print_help(),
            "quit" | "exit" => break,
            "statuses" => {
                for (key, description) in TaskStatus::variants() {
                    println!("  {:<14} {}", key, description);
                }
            }
            "add" => {
                let student = parse_student(parts.next());
                let date = parse_date(parts.next());
                let subject = parts.next();
                let title = parts.collect::<Vec<_>>().join(" ");
                match (student, date, subject) {
                    (Some(student), Some(date), Some(subject)) if !title.is_empty() => {
                        insert(store, NewTask::subject(student, date, subject, title));
                    }
                    _ => println!("Usage: add <student> <YYYY-MM-DD> <subject> <title...>"),
                }
            }
            "rest" | "leave" => {
                let student = parse_student(parts.next());
                let date = parse_date(parts.next());
                match (student, date) {
                    (Some(student), Some(date)) => {
                        let task = if cmd == "rest" {
                            NewTask::rest_day(student, date)
                        } else {
                            NewTask::leave_day(student, date)
                        };
                        insert(store, task);
                    }
                    _ => println!("Usage: {cmd} <student> <YYYY-MM-DD>"),
                }
            }
            "done" => match parts.next().and_then(|v| v.parse::<TaskId>().ok()) {
                Some(id) => {
                    let result = store.write(|repo| repo.set_completed(id, true));
                    match result {
                        Ok(()) => println!("Task {id} completed."),
                        Err(e) => println!("Error: {e}"),
                    }
                }
                None => println!("Usage: done <task_id>"),
            },
            "remove" => {
                let id = parts.next().and_then(|v| v.parse::<TaskId>().ok());
                let reason = parts.collect::<Vec<_>>().join(" ");
                match id {
                    Some(id) if !reason.is_empty() => match store.remove_task(id, &reason) {
                        Ok(task) => println!("Removed task {} from {}.", task.id, task.date),
                        Err(e) => println!("Error: {e}"),
                    },
                    _ => println!("Usage: remove <task_id> <reason...>"),
                }
            }
            "show" => match (parse_student(parts.next()), parse_date(parts.next())) {
                (Some(student), Some(date)) => show_day(store, student, date),
                _ => println!("Usage: show <student> <YYYY-MM-DD>"),
            },
            "policy" => {
                let sub = parts.next();
                let student = parse_student(parts.next());
                match (sub, student) {
                    (Some("show"), Some(student)) => {
                        let defaults = engine.default_policy();
                        match store.read(|repo| repo.policy_or(student, defaults)) {
                            Ok(p) => println!(
                                "Student {}: cap={} threshold={} horizon={} cutoff={}",
                                p.student_id,
                                p.daily_task_cap,
                                p.threshold,
                                p.horizon_days,
                                p.cutoff_time
                            ),
                            Err(e) => println!("Error: {e}"),
                        }
                    }
                    (Some("set"), Some(student)) => {
                        let values: Vec<Option<u32>> =
                            parts.take(3).map(|v| v.parse().ok()).collect();
                        match values.as_slice() {
                            [Some(cap), Some(threshold), Some(horizon)] => {
                                let mut policy = engine.default_policy().for_student(student);
                                policy.daily_task_cap = *cap;
                                policy.threshold = *threshold;
                                policy.horizon_days = *horizon;
                                match store.write(|repo| repo.upsert_policy(&policy)) {
                                    Ok(()) => println!("Policy updated for student {student}."),
                                    Err(e) => println!("Error: {e}"),
                                }
                            }
                            _ => println!(
                                "Usage: policy set <student> <cap> <threshold> <horizon>"
                            ),
                        }
                    }
                    _ => println!("Usage: policy <show|set> <student> ..."),
                }
            }
            "close" => match (parse_student(parts.next()), parse_date(parts.next())) {
                (Some(student), Some(date)) => match engine.reschedule(student, date) {
                    Ok(outcome) => {
                        println!("Closed out ({})", outcome.to_cli_summary());
                        if let Some(dest) = outcome.destination {
                            show_day(store, student, dest);
                        }
                    }
                    Err(e) => println!("Closeout error: {e}"),
                },
                _ => println!("Usage: close <student> <YYYY-MM-DD>"),
            },
            "closeall" => match parse_date(parts.next()) {
                Some(date) => match DailyCloseout::new(&engine)
                    .with_workers(config.workers)
                    .run(date)
                {
                    Ok(report) => {
                        println!("Batch finished ({})", report.to_cli_summary());
                        for failure in &report.failures {
                            println!("  student {}: {}", failure.student_id, failure.error);
                        }
                    }
                    Err(e) => println!("Batch error: {e}"),
                },
                None => println!("Usage: closeall <YYYY-MM-DD>"),
            },
            "audit" => match parse_student(parts.next()) {
                Some(student) => {
                    let mut query = AuditQuery::for_student(student);
                    query.from = parse_date(parts.next());
                    query.to = parse_date(parts.next());
                    match store.read(|repo| repo.query_audit(&query)) {
                        Ok(entries) => println!("{}", render_audit(&entries)),
                        Err(e) => println!("Error: {e}"),
                    }
                }
                None => println!("Usage: audit <student> [from] [to]"),
            },
            "status" => {
                let status = config.trigger.status(Local::now().naive_local());
                println!("Trigger enabled    : {}", status.is_enabled);
                match status.next_scheduled_run {
                    Some(next) => println!("Next scheduled run : {next}"),
                    None => println!("Next scheduled run : -"),
                }
            }
            _ => println!("Unknown command '{cmd}'. Type 'help'."),
        }
    }
}
