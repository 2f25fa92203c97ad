/// Integration tests for the conversion queue.
///
/// These drive the public queue API end to end with a scripted converter
/// standing in for the engine, so no LibreOffice installation is needed.
///
/// ## Running Tests
///
/// ```bash
/// cargo test --test conversion_queue_test
/// ```

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pdfer::{
        converter::DocumentConverter,
        error::{ConversionError, JobFailure},
        job::{ConversionJob, JobResult},
        queue::ConversionQueue,
        retry::RetryPolicy,
    };
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{oneshot, Semaphore};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Clone, Copy)]
    enum Step {
        Crash,
        Unreadable,
    }

    /// Fake engine. Each document fails according to its script and then
    /// converts; `always_crash` documents never convert.
    #[derive(Default)]
    struct ScriptedConverter {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        always_crash: Mutex<Vec<String>>,
        attempts: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        hold: Option<Arc<Semaphore>>,
        work: Duration,
    }

    impl ScriptedConverter {
        fn script(self, name: &str, steps: &[Step]) -> Self {
            self.scripts
                .lock()
                .insert(name.to_string(), steps.iter().copied().collect());
            self
        }

        fn always_crash(self, name: &str) -> Self {
            self.always_crash.lock().push(name.to_string());
            self
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl DocumentConverter for ScriptedConverter {
        async fn convert(&self, job: &ConversionJob) -> Result<(), ConversionError> {
            let name = job
                .source_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            self.attempts.lock().push(name.clone());

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            if let Some(hold) = &self.hold {
                hold.acquire().await.expect("gate closed").forget();
            }
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }

            let step = self
                .scripts
                .lock()
                .get_mut(&name)
                .and_then(|steps| steps.pop_front());
            let crashes = step.is_none() && self.always_crash.lock().contains(&name);

            self.active.fetch_sub(1, Ordering::SeqCst);
            match step {
                Some(Step::Unreadable) => Err(ConversionError::UnsupportedFormat {
                    path: job.source_path.clone(),
                    detail: "file could not be opened".to_string(),
                }),
                Some(Step::Crash) => Err(ConversionError::EngineFailure(
                    "listener closed the connection".to_string(),
                )),
                None if crashes => Err(ConversionError::EngineFailure(
                    "listener closed the connection".to_string(),
                )),
                None => Ok(()),
            }
        }
    }

    fn queue_for(converter: Arc<ScriptedConverter>, max_retries: u32) -> ConversionQueue {
        ConversionQueue::with_drain_delay(
            converter,
            RetryPolicy::new(max_retries),
            Duration::from_millis(10),
        )
    }

    fn job(name: &str) -> ConversionJob {
        ConversionJob::new(
            format!("/tmp/pdfer-test/{}.docx", name),
            format!("/tmp/pdfer-test/{}.pdf", name),
        )
    }

    fn pdf(name: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/pdfer-test/{}.pdf", name))
    }

    /// Records the order in which submitted jobs reach a terminal outcome.
    fn watch_completions(
        jobs: Vec<(&'static str, oneshot::Receiver<JobResult>)>,
    ) -> (Arc<Mutex<Vec<&'static str>>>, Vec<tokio::task::JoinHandle<JobResult>>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles = jobs
            .into_iter()
            .map(|(name, rx)| {
                let order = order.clone();
                tokio::spawn(async move {
                    let outcome = rx.await.expect("job abandoned");
                    order.lock().push(name);
                    outcome
                })
            })
            .collect();
        (order, handles)
    }

    /// A document that keeps crashing the engine is retried at the tail of the
    /// queue until its budget is spent, without holding up the others.
    #[tokio::test]
    async fn test_failing_job_does_not_block_queue() {
        let converter = Arc::new(ScriptedConverter::default().always_crash("two"));
        let queue = queue_for(converter.clone(), 5);

        let submitted = vec![
            ("one", queue.submit(job("one"))),
            ("two", queue.submit(job("two"))),
            ("three", queue.submit(job("three"))),
        ];
        let (order, handles) = watch_completions(submitted);

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(timeout(WAIT, handle).await.unwrap().unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                Ok(pdf("one")),
                Err(JobFailure::ConversionFailed),
                Ok(pdf("three")),
            ]
        );
        assert_eq!(*order.lock(), vec!["one", "three", "two"]);
        assert_eq!(
            converter.attempts(),
            vec!["one", "two", "three", "two", "two", "two", "two", "two"]
        );
        assert_eq!(queue.size(), 0);
    }

    /// An unreadable document fails on its first attempt and is never retried.
    #[tokio::test]
    async fn test_unsupported_input_is_not_retried() {
        let converter =
            Arc::new(ScriptedConverter::default().script("broken", &[Step::Unreadable]));
        let queue = queue_for(converter.clone(), 5);

        let outcome = timeout(WAIT, queue.submit(job("broken")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome, Err(JobFailure::NotSupported));
        assert_eq!(converter.attempts(), vec!["broken"]);
    }

    /// A retried job goes behind work that was already waiting.
    #[tokio::test]
    async fn test_retry_goes_to_tail() {
        let converter = Arc::new(
            ScriptedConverter::default()
                .script("a", &[Step::Crash])
                .script("b", &[Step::Crash]),
        );
        let queue = queue_for(converter.clone(), 5);

        let a = queue.submit(job("a"));
        let b = queue.submit(job("b"));

        assert_eq!(timeout(WAIT, a).await.unwrap().unwrap(), Ok(pdf("a")));
        assert_eq!(timeout(WAIT, b).await.unwrap().unwrap(), Ok(pdf("b")));
        assert_eq!(converter.attempts(), vec!["a", "b", "a", "b"]);
    }

    /// A transient failure followed by success completes normally.
    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let converter = Arc::new(
            ScriptedConverter::default().script("flaky", &[Step::Crash, Step::Crash]),
        );
        let queue = queue_for(converter.clone(), 5);

        let outcome = queue.convert(PathBuf::from("/tmp/pdfer-test/flaky.docx"), pdf("flaky"));

        assert_eq!(
            timeout(WAIT, outcome).await.unwrap(),
            Some(Ok(pdf("flaky")))
        );
        assert_eq!(converter.attempts().len(), 3);
    }

    /// Under concurrent submission the engine never sees two conversions at
    /// once, and every job completes exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_conversion_in_flight() {
        let mut converter = ScriptedConverter::default();
        converter.work = Duration::from_millis(2);
        for i in (0..20).step_by(3) {
            converter = converter.script(&format!("doc{}", i), &[Step::Crash]);
        }
        let converter = Arc::new(converter);
        let queue = queue_for(converter.clone(), 5);

        let mut submitters = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            submitters.push(tokio::spawn(async move {
                let name = format!("doc{}", i);
                queue
                    .convert(
                        PathBuf::from(format!("/tmp/pdfer-test/{}.docx", name)),
                        pdf(&name),
                    )
                    .await
            }));
        }

        let mut completed = Vec::new();
        for submitter in submitters {
            completed.push(timeout(WAIT, submitter).await.unwrap().unwrap());
        }

        assert_eq!(converter.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(completed.len(), 20);
        assert!(completed.iter().all(|c| matches!(c, Some(Ok(_)))));
        // 20 first attempts plus one retry for every third document.
        assert_eq!(converter.attempts().len(), 27);
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_busy());
    }

    /// Reset reports how many waiting jobs it dropped, and the queue keeps
    /// serving new work afterwards.
    #[tokio::test]
    async fn test_reset_then_continue() {
        let hold = Arc::new(Semaphore::new(0));
        let converter = Arc::new(ScriptedConverter {
            hold: Some(hold.clone()),
            ..Default::default()
        });
        let queue = queue_for(converter.clone(), 5);

        let running = queue.submit(job("running"));
        let dropped: Vec<_> = ["w1", "w2", "w3"]
            .iter()
            .map(|name| queue.submit(job(name)))
            .collect();
        tokio::task::yield_now().await;

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.reset(), 3);
        assert_eq!(queue.size(), 0);

        hold.add_permits(2);
        assert_eq!(
            timeout(WAIT, running).await.unwrap().unwrap(),
            Ok(pdf("running"))
        );
        for rx in dropped {
            assert!(timeout(WAIT, rx).await.unwrap().is_err());
        }

        let after = queue.submit(job("after"));
        assert_eq!(timeout(WAIT, after).await.unwrap().unwrap(), Ok(pdf("after")));
        assert_eq!(converter.attempts(), vec!["running", "after"]);
    }
}
