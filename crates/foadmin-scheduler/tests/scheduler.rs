//! End-to-end scheduling against an in-memory store with real timers.

use std::time::Duration;

use foadmin_core::config::SchedulerConfig;
use foadmin_scheduler::{
    tasks::register_builtin, JobFilter, JobService, JobStatus, JobStore, JobType, LogFilter,
    LogStatus, NewJob, Scheduler, SchedulerError, TaskTable,
};
use serde_json::Value;

struct Harness {
    scheduler: Scheduler,
    service: JobService,
    store: JobStore,
}

fn harness() -> Harness {
    let store = JobStore::open_in_memory().unwrap();
    let mut tasks = TaskTable::new();
    register_builtin(&mut tasks, store.clone(), 30).unwrap();
    tasks
        .register_fn("tests.fail", |_| async {
            Err::<Value, _>(anyhow::anyhow!("intentional failure"))
        })
        .unwrap();
    let config = SchedulerConfig {
        timezone: "UTC".to_string(),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::build(store.clone(), tasks, &config).unwrap();
    let service = JobService::new(scheduler.bridge().clone());
    Harness {
        scheduler,
        service,
        store,
    }
}

fn every(job_id: &str, secs: i64, func_name: &str, args: Option<&str>) -> NewJob {
    NewJob {
        name: job_id.to_string(),
        job_id: job_id.to_string(),
        job_type: JobType::Interval,
        func_name: func_name.to_string(),
        func_args: args.map(str::to_string),
        func_kwargs: None,
        cron_expression: None,
        interval_seconds: Some(secs),
        run_date: None,
        status: JobStatus::Enabled,
        description: None,
        remark: None,
    }
}

fn log_count(store: &JobStore, job_id: &str) -> u64 {
    let filter = LogFilter {
        job_id: Some(job_id.to_string()),
        status: None,
    };
    store.list_logs(&filter, 1, 200).unwrap().total
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interval_job_logs_every_fire() {
    let h = harness();
    h.scheduler.start().unwrap();
    let job = h
        .service
        .create_job(every("demo1", 2, "tasks.hello_task", Some(r#"["World"]"#)))
        .unwrap();

    sleep_ms(5_300).await;
    h.scheduler.shutdown();

    let logs = h
        .store
        .list_logs(
            &LogFilter {
                job_id: Some("demo1".to_string()),
                status: Some(LogStatus::Success),
            },
            1,
            50,
        )
        .unwrap();
    assert!(logs.total >= 2, "expected at least two fires, got {}", logs.total);
    for row in &logs.items {
        assert!(row.result.as_deref().unwrap().contains("Hello, World"));
        assert!(row.duration.is_some());
    }

    let job = h.store.get_job(job.id).unwrap();
    assert_eq!(job.run_count as u64, logs.total);
    assert_eq!(job.fail_count, 0);
    assert!(job.last_run_time.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn six_field_cron_fires_every_second() {
    let h = harness();
    h.scheduler.start().unwrap();
    let mut def = every("per-second", 1, "tasks.database_backup", None);
    def.job_type = JobType::Cron;
    def.interval_seconds = None;
    def.cron_expression = Some("* * * * * *".to_string());
    h.service.create_job(def).unwrap();

    sleep_ms(2_600).await;
    h.scheduler.shutdown();
    assert!(log_count(&h.store, "per-second") >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_job_keeps_firing_without_disturbing_others() {
    let h = harness();
    h.scheduler.start().unwrap();
    let bad = h.service.create_job(every("bad", 1, "tests.fail", None)).unwrap();
    let good = h
        .service
        .create_job(every("good", 1, "tasks.send_daily_report", None))
        .unwrap();

    sleep_ms(3_400).await;
    h.scheduler.shutdown();

    let bad = h.store.get_job(bad.id).unwrap();
    assert!(bad.run_count >= 2);
    assert_eq!(bad.fail_count, bad.run_count);

    let good = h.store.get_job(good.id).unwrap();
    assert!(good.run_count >= 2);
    assert_eq!(good.fail_count, 0);

    let failures = h
        .store
        .list_logs(
            &LogFilter {
                job_id: Some("bad".to_string()),
                status: Some(LogStatus::Failure),
            },
            1,
            10,
        )
        .unwrap();
    let row = &failures.items[0];
    assert_eq!(row.error.as_deref(), Some("intentional failure"));
    assert!(row.traceback.is_some());
    assert!(row.result.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_stops_firing_until_resume() {
    let h = harness();
    h.scheduler.start().unwrap();
    let job = h
        .service
        .create_job(every("pausable", 1, "tasks.database_backup", None))
        .unwrap();

    sleep_ms(1_500).await;
    h.service.pause_job(job.id).unwrap();
    // Let any execution that had already started finish.
    sleep_ms(200).await;
    let before = log_count(&h.store, "pausable");
    assert!(before >= 1);

    sleep_ms(2_500).await;
    assert_eq!(log_count(&h.store, "pausable"), before);

    // Running on demand ignores the pause.
    let outcome = h.service.run_job_now(job.id).unwrap().await.unwrap().unwrap();
    assert!(outcome.succeeded());
    assert_eq!(log_count(&h.store, "pausable"), before + 1);

    h.service.resume_job(job.id).unwrap();
    sleep_ms(2_500).await;
    h.scheduler.shutdown();
    assert!(log_count(&h.store, "pausable") >= before + 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacing_a_job_leaves_one_driver() {
    let h = harness();
    h.scheduler.start().unwrap();
    let job = h
        .service
        .create_job(every("replaced", 1, "tasks.database_backup", None))
        .unwrap();
    // Rescheduling the same row goes through add_or_replace again.
    h.scheduler.bridge().schedule(&job).unwrap();
    h.scheduler.bridge().schedule(&job).unwrap();
    assert_eq!(h.scheduler.registry().len(), 1);

    sleep_ms(3_300).await;
    h.scheduler.shutdown();
    let fired = log_count(&h.store, "replaced");
    assert!((2..=4).contains(&fired), "unexpected fire count {fired}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_load_skips_unschedulable_rows() {
    let h = harness();
    h.store
        .insert_job(&every("fine", 3600, "tasks.hello_task", None))
        .unwrap();

    let mut bad_cron = every("bad-cron", 0, "tasks.hello_task", None);
    bad_cron.job_type = JobType::Cron;
    bad_cron.cron_expression = Some("bad expr".to_string());
    h.store.insert_job(&bad_cron).unwrap();
    h.store
        .insert_job(&every("unknown", 60, "app.tasks.missing.run", None))
        .unwrap();

    let report = h.scheduler.start().unwrap().unwrap();
    assert_eq!(report.loaded, vec!["fine".to_string()]);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(h.scheduler.registry().job_ids(), vec!["fine".to_string()]);

    // Skipped rows are kept for the operator to fix.
    let all = h.service.list_jobs(&JobFilter::default(), 1, 20).unwrap();
    assert_eq!(all.total, 3);
    h.scheduler.shutdown();
}

#[tokio::test]
async fn bad_expression_is_rejected_before_anything_is_registered() {
    let h = harness();
    let mut def = every("nope", 1, "tasks.hello_task", None);
    def.job_type = JobType::Cron;
    def.cron_expression = Some("bad expr".to_string());

    let err = h.service.create_job(def).unwrap_err();
    assert!(matches!(err, SchedulerError::Configuration(_)));
    assert!(h.scheduler.registry().is_empty());
    assert!(h.store.find_by_job_id("nope").unwrap().is_none());

    let mut ok = every("every-minute", 1, "tasks.hello_task", None);
    ok.job_type = JobType::Cron;
    ok.cron_expression = Some("0 * * * * *".to_string());
    assert!(h.service.create_job(ok).is_ok());
}
