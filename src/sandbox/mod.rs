//! Bounded JavaScript execution.
//!
//! Every run gets a fresh QuickJS runtime with three independent bounds:
//!
//! - heap: the runtime allocation limit (`MemoryExceeded`),
//! - wall clock: a deadline checked by the engine interrupt hook and by
//!   every host-side wait (`TimedOut`),
//! - steps: statements executed, counted by the hidden counter that
//!   [`meter`] weaves into the guest source (`StepLimitExceeded`).
//!
//! The only host capability in the guest's global scope is `fetch` (plus
//! `JSONPath` when the code refers to it). See [`scheduler`] for how
//! asynchronous guest code is driven to a final value.

pub mod jsonpath;

mod bindings;
mod meter;
mod scheduler;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Coerced, Context, Ctx, Module, Runtime, Value};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::http::{FetchClient, FetchError};
use meter::Meter;
use scheduler::{RunState, Scheduler};

/// Returned for `undefined`, `null` and empty-string results.
pub const VOID_RESULT: &str = "void";

/// Extra time the async caller waits past the run deadline before giving
/// up on the worker thread.
const OUTER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("malformed guest code: {0}")]
    MalformedGuestCode(String),

    #[error("memory limit exceeded")]
    MemoryExceeded,

    #[error("execution timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    #[error("uncaught exception: {0}")]
    GuestException(String),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("sandbox engine error: {0}")]
    Engine(String),
}

impl SandboxError {
    /// Short, content-free name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::MalformedGuestCode(_) => "malformed guest code",
            SandboxError::MemoryExceeded => "memory limit",
            SandboxError::TimedOut(_) => "timeout",
            SandboxError::StepLimitExceeded(_) => "step limit",
            SandboxError::GuestException(_) => "uncaught exception",
            SandboxError::Fetch(_) => "fetch failure",
            SandboxError::Engine(_) => "engine error",
        }
    }
}

impl From<rquickjs::Error> for SandboxError {
    fn from(e: rquickjs::Error) -> Self {
        match e {
            rquickjs::Error::Allocation => SandboxError::MemoryExceeded,
            other => SandboxError::Engine(other.to_string()),
        }
    }
}

/// How guest code is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestForm {
    /// A script; its completion value is the result.
    Program,
    /// Statements with a top-level `return` and/or `await`; run as the body
    /// of an async function whose return value is the result.
    FunctionBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Time,
    Steps,
}

/// Wall-clock and step accounting for one run. Shared by the interrupt
/// hook, the statement counter and the scheduler; once tripped it stays
/// tripped.
pub(crate) struct Governor {
    deadline: Instant,
    timeout: Duration,
    max_steps: u64,
    steps: Cell<u64>,
    tripped: Cell<Option<Bound>>,
}

impl Governor {
    fn new(timeout: Duration, max_steps: u64) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            max_steps,
            steps: Cell::new(0),
            tripped: Cell::new(None),
        }
    }

    /// Interrupt hook body. Returning true aborts the running guest code.
    fn poll(&self) -> bool {
        if self.tripped.get().is_some() {
            return true;
        }
        if Instant::now() >= self.deadline {
            self.tripped.set(Some(Bound::Time));
            return true;
        }
        false
    }

    /// Counts one guest statement. False once any bound is crossed.
    fn step(&self) -> bool {
        if self.tripped.get().is_some() {
            return false;
        }
        let steps = self.steps.get().saturating_add(1);
        self.steps.set(steps);
        if steps > self.max_steps {
            self.tripped.set(Some(Bound::Steps));
            return false;
        }
        true
    }

    /// Fails once any bound has been crossed.
    pub(crate) fn check(&self) -> Result<(), SandboxError> {
        if self.tripped.get().is_none() && Instant::now() >= self.deadline {
            self.tripped.set(Some(Bound::Time));
        }
        match self.tripped.get() {
            None => Ok(()),
            Some(Bound::Time) => Err(SandboxError::TimedOut(self.timeout)),
            Some(Bound::Steps) => Err(SandboxError::StepLimitExceeded(self.max_steps)),
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Marks the deadline as reached (a host wait ran out of time).
    pub(crate) fn expire(&self) -> SandboxError {
        self.tripped.set(Some(Bound::Time));
        SandboxError::TimedOut(self.timeout)
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    fetch: FetchClient,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, fetch: FetchClient) -> Self {
        Self { config, fetch }
    }

    /// Compiles `code` without running it and reports which form it takes.
    pub fn validate(&self, code: &str) -> Result<GuestForm, SandboxError> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(self.config.memory_limit_bytes);
        runtime.set_max_stack_size(self.config.max_stack_bytes);
        let context = Context::full(&runtime)?;
        context.with(|ctx| classify(&ctx, code))
    }

    /// Runs `code` to a final textual result.
    ///
    /// The run happens on a blocking worker thread; host I/O for `fetch`
    /// goes through the current tokio runtime.
    pub async fn execute(&self, code: SecretString) -> Result<String, SandboxError> {
        let worker = GuestRun {
            config: self.config.clone(),
            fetch: self.fetch.clone(),
            runtime: tokio::runtime::Handle::current(),
        };
        let timeout = self.config.timeout();
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || worker.run(code.expose_secret()));
        let result = match tokio::time::timeout(timeout + OUTER_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::Engine(format!("sandbox worker failed: {e}"))),
            Err(_) => {
                warn!("Sandbox worker did not stop within the deadline");
                Err(SandboxError::TimedOut(timeout))
            }
        };

        // Guest errors can echo substituted secrets; the gateway logs them
        // once redacted.
        match &result {
            Ok(_) => info!("Script completed in {}ms", started.elapsed().as_millis()),
            Err(e) => info!("Script failed after {}ms ({})", started.elapsed().as_millis(), e.kind()),
        }
        result
    }
}

/// Everything a worker thread needs for one run.
struct GuestRun {
    config: SandboxConfig,
    fetch: FetchClient,
    runtime: tokio::runtime::Handle,
}

impl GuestRun {
    fn run(self, code: &str) -> Result<String, SandboxError> {
        let governor = Rc::new(Governor::new(self.config.timeout(), self.config.max_steps));

        let runtime = Runtime::new()?;
        runtime.set_memory_limit(self.config.memory_limit_bytes);
        runtime.set_max_stack_size(self.config.max_stack_bytes);
        let hook = Rc::clone(&governor);
        runtime.set_interrupt_handler(Some(Box::new(move || hook.poll())));
        let context = Context::full(&runtime)?;

        let result = context.with(|ctx| {
            let state = Rc::new(RefCell::new(RunState::default()));
            let scheduler = Scheduler {
                ctx: ctx.clone(),
                state: Rc::clone(&state),
                governor: governor.as_ref(),
                fetch: &self.fetch,
                runtime: &self.runtime,
            };

            let result = self.evaluate(&scheduler, &governor, code);
            debug!(
                "Run used {} step(s), {} response(s)",
                governor.steps.get(),
                state.borrow().open_responses()
            );
            state.borrow_mut().clear();
            result
        });

        runtime.set_interrupt_handler(None);
        result
    }

    fn evaluate<'js>(
        &self,
        scheduler: &Scheduler<'_, 'js>,
        governor: &Rc<Governor>,
        code: &str,
    ) -> Result<String, SandboxError> {
        let ctx = &scheduler.ctx;
        let form = classify(ctx, code)?;
        bindings::install(ctx, &scheduler.state, code.contains(bindings::JSONPATH_GLOBAL))?;

        let source = match form {
            GuestForm::Program => code.to_string(),
            GuestForm::FunctionBody => format!("(async () => {{\n{code}\n}})()"),
        };
        let meter = Meter::new();
        let source = meter
            .instrument(&source)
            .map_err(|e| SandboxError::Engine(format!("cannot meter guest code: {e}")))?;
        meter.install(ctx, Rc::clone(governor))?;

        let root = ctx
            .eval::<Value<'js>, _>(source)
            .map_err(|e| scheduler.failure(e))?;

        let value = scheduler.run_to_completion(root)?;
        // A guest catch may have swallowed the counter's exception
        scheduler.governor.check()?;
        stringify(ctx, value).map_err(|e| scheduler.failure(e))
    }
}

/// Decides the form of `code` by compiling it (never executing it) as a
/// module, which rejects top-level `return`, then inside a plain function,
/// which rejects top-level `await`. Code failing either check is tried as
/// an async function body.
fn classify(ctx: &Ctx<'_>, code: &str) -> Result<GuestForm, SandboxError> {
    let compiles = |name: &str, source: String| {
        Module::declare(ctx.clone(), name, source)
            .catch(ctx)
            .map(|_| ())
            .map_err(|e| e.to_string())
    };

    let as_module = compiles("guest_program", code.to_string());
    let without_await = compiles("guest_sync_body", format!("export default function () {{\n{code}\n}}"));
    if as_module.is_ok() && without_await.is_ok() {
        return Ok(GuestForm::Program);
    }

    match compiles("guest_async_body", format!("export default async function () {{\n{code}\n}}")) {
        Ok(()) => Ok(GuestForm::FunctionBody),
        Err(message) => Err(SandboxError::MalformedGuestCode(first_line(&message))),
    }
}

fn first_line(message: &str) -> String {
    message
        .trim_start_matches("Error: ")
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Textual form of the final value.
fn stringify<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<String> {
    if value.is_undefined() || value.is_null() {
        return Ok(VOID_RESULT.to_string());
    }

    let text = if let Some(s) = value.as_string() {
        s.to_string()?
    } else if value.is_object() && !value.is_function() {
        match ctx.json_stringify(value)? {
            Some(json) => json.to_string()?,
            None => String::new(),
        }
    } else {
        value.get::<Coerced<String>>()?.0
    };

    if text.is_empty() {
        Ok(VOID_RESULT.to_string())
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, ResilienceConfig};
    use crate::http::build_http_client;
    use crate::http::stub::{closed_port_url, StubResponse, StubServer};

    fn sandbox_with(config: SandboxConfig) -> Sandbox {
        let resilience = ResilienceConfig {
            max_retries: 1,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            ..ResilienceConfig::default()
        };
        let client = build_http_client(&HttpConfig::default()).unwrap();
        Sandbox::new(config, FetchClient::new(client, resilience, 1024 * 1024))
    }

    fn sandbox() -> Sandbox {
        sandbox_with(SandboxConfig::default())
    }

    async fn run(code: &str) -> Result<String, SandboxError> {
        sandbox().execute(SecretString::from(code)).await
    }

    // ── classification ──────────────────────────────────

    #[test]
    fn test_classify_forms() {
        let sandbox = sandbox();
        assert_eq!(sandbox.validate("1 + 2").unwrap(), GuestForm::Program);
        assert_eq!(
            sandbox.validate("(async () => { return 1 })()").unwrap(),
            GuestForm::Program
        );
        assert_eq!(sandbox.validate("return 'x'").unwrap(), GuestForm::FunctionBody);
        assert_eq!(
            sandbox.validate("const r = await Promise.resolve(1); return r").unwrap(),
            GuestForm::FunctionBody
        );
    }

    #[test]
    fn test_classify_malformed() {
        let err = sandbox().validate("return (1 + ;").unwrap_err();
        assert!(matches!(err, SandboxError::MalformedGuestCode(_)), "got {err:?}");
        assert!(matches!(
            sandbox().validate("function {"),
            Err(SandboxError::MalformedGuestCode(_))
        ));
    }

    #[test]
    fn test_validate_does_not_execute() {
        // Would exhaust any step budget if it ran
        assert_eq!(
            sandbox().validate("while (true) {}").unwrap(),
            GuestForm::Program
        );
    }

    // ── results ─────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn test_program_completion_value() {
        assert_eq!(run("1 + 2").await.unwrap(), "3");
        assert_eq!(run("'hello'").await.unwrap(), "hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_function_body_return() {
        assert_eq!(run("return \"X\" + \"sk-123\"").await.unwrap(), "Xsk-123");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_iife_awaited() {
        let code = "(async () => { const v = await Promise.resolve(20); return v + 1; })()";
        assert_eq!(run(code).await.unwrap(), "21");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_void_results() {
        assert_eq!(run("undefined").await.unwrap(), VOID_RESULT);
        assert_eq!(run("null").await.unwrap(), VOID_RESULT);
        assert_eq!(run("''").await.unwrap(), VOID_RESULT);
        assert_eq!(run("let x = 1;").await.unwrap(), VOID_RESULT);
        assert_eq!(run("return;").await.unwrap(), VOID_RESULT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_objects_serialized_as_json() {
        assert_eq!(run("({a: 1, b: [true, null]})").await.unwrap(), r#"{"a":1,"b":[true,null]}"#);
        assert_eq!(run("return [1, 'two']").await.unwrap(), r#"[1,"two"]"#);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_strict_mode() {
        let err = run("undeclared = 5; undeclared").await.unwrap_err();
        assert!(matches!(err, SandboxError::GuestException(_)), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_uncaught_exception() {
        let err = run("throw new RangeError('bad input')").await.unwrap_err();
        match err {
            SandboxError::GuestException(msg) => assert_eq!(msg, "RangeError: bad input"),
            other => panic!("unexpected {other:?}"),
        }

        let err = run("return Promise.reject('plain')").await.unwrap_err();
        assert!(matches!(err, SandboxError::GuestException(ref m) if m == "plain"), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_never_settling_promise() {
        let err = run("return new Promise(() => {})").await.unwrap_err();
        assert!(
            matches!(err, SandboxError::GuestException(ref m) if m.contains("never settled")),
            "got {err:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_host_globals_besides_fetch() {
        let code = "[typeof fetch, typeof require, typeof process, typeof std, typeof os, typeof globalThis['JSON' + 'Path']].join(',')";
        assert_eq!(
            run(code).await.unwrap(),
            "function,undefined,undefined,undefined,undefined,undefined"
        );
        // Installed once the code names it
        assert_eq!(run("typeof JSONPath").await.unwrap(), "function");
    }

    // ── bounds ──────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn test_step_limit_exceeded() {
        let sandbox = sandbox_with(SandboxConfig {
            max_steps: 5,
            timeout_ms: 30_000,
            ..SandboxConfig::default()
        });
        let code = "let n = 0; for (let i = 0; i < 10; i++) { n += i; } n";
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(5)), "got {err:?}");

        // The same loop fits the default budget
        assert_eq!(run(code).await.unwrap(), "45");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_step_limit_counts_statements_in_callbacks() {
        let sandbox = sandbox_with(SandboxConfig {
            max_steps: 20,
            timeout_ms: 30_000,
            ..SandboxConfig::default()
        });
        let code = "let n = 0; [1, 2, 3, 4, 5, 6, 7, 8, 9, 10].forEach(x => { n += x; n *= 2; }); n";
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(20)), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_step_limit_not_swallowed_by_finally() {
        let sandbox = sandbox_with(SandboxConfig {
            max_steps: 10,
            timeout_ms: 30_000,
            ..SandboxConfig::default()
        });
        let code = "let r = 'none'; try { for (;;) {} } catch (e) { r = 'caught'; } finally { r = 'done'; } r";
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(10)), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_metered_code_keeps_semantics() {
        let code = r#"
            class Counter { n = 0; add(x) { this.n += x; return this; } }
            const c = new Counter();
            let i = 0;
            do { c.add(i); i++; } while (i < 4);
            switch (c.n) { case 6: { i = 'six'; break; } default: i = 'other'; }
            const o = { a: { b: [1, 2] }, re: /[{;]/.test('{') };
            `${i}:${o.a.b.length}:${o.re}:${ { k: c.n }.k }`
        "#;
        assert_eq!(run(code).await.unwrap(), "six:2:true:6");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_step_limit_not_caught_by_guest() {
        let sandbox = sandbox_with(SandboxConfig {
            max_steps: 5,
            timeout_ms: 30_000,
            ..SandboxConfig::default()
        });
        let code = "try { while (true) {} } catch (e) { 'escaped' }";
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(_)), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout() {
        let sandbox = sandbox_with(SandboxConfig {
            timeout_ms: 200,
            max_steps: u64::MAX,
            ..SandboxConfig::default()
        });
        let started = Instant::now();
        let err = sandbox.execute(SecretString::from("while (true) {}")).await.unwrap_err();
        assert!(matches!(err, SandboxError::TimedOut(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_memory_exceeded() {
        let sandbox = sandbox_with(SandboxConfig {
            max_steps: u64::MAX,
            timeout_ms: 30_000,
            ..SandboxConfig::default()
        });
        let code = "(() => { const a = []; while (true) { a.push(new Array(100000).fill(1)); } })()";
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::MemoryExceeded), "got {err:?}");
    }

    // ── fetch ───────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_json() {
        let server = StubServer::start(vec![StubResponse::ok(r#"{"title":"foo","id":1}"#)
            .header("Content-Type", "application/json")])
        .await;
        let code = format!(
            "const r = await fetch('{}');\nconst data = await r.json();\nreturn data.title + ':' + r.status + ':' + r.ok + ':' + r.headers.get('CONTENT-TYPE');",
            server.url("/posts/1")
        );
        assert_eq!(run(&code).await.unwrap(), "foo:200:true:application/json");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_body_read_once() {
        let server = StubServer::start(vec![StubResponse::ok("payload")]).await;
        let code = format!(
            "const r = await fetch('{}');\nconst a = await r.text();\nconst b = await r.text();\nconst buf = await r.blob();\nreturn [a, b, buf.byteLength].join('|');",
            server.url("/")
        );
        assert_eq!(run(&code).await.unwrap(), "payload|payload|7");
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_post_with_options() {
        let server = StubServer::start(vec![StubResponse::new(201, "Created", r#"{"title":"foo"}"#)]).await;
        let code = format!(
            r#"(async () => {{
                const response = await fetch('{}', {{
                    method: 'post',
                    body: JSON.stringify({{ title: 'foo' }}),
                    headers: {{ 'Content-Type': 'application/json', 'X-Trace': 'abc' }}
                }});
                return response.status + ' ' + response.statusText;
            }})()"#,
            server.url("/posts")
        );
        assert_eq!(run(&code).await.unwrap(), "201 Created");

        let request = &server.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, r#"{"title":"foo"}"#);
        assert_eq!(request.header_values("content-type"), vec!["application/json"]);
        assert_eq!(request.header_values("x-trace"), vec!["abc"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_non_2xx_does_not_throw() {
        let server = StubServer::start(vec![StubResponse::new(404, "Not Found", "missing")]).await;
        let code = format!("const r = await fetch('{}'); return r.ok + ' ' + r.status", server.url("/"));
        assert_eq!(run(&code).await.unwrap(), "false 404");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_parallel_with_promise_all() {
        let server = StubServer::start(vec![StubResponse::ok("x")]).await;
        let url = server.url("/");
        let code = format!(
            "const rs = await Promise.all([fetch('{url}'), fetch('{url}'), fetch('{url}')]);\nreturn rs.map(r => r.status).join(',')"
        );
        assert_eq!(run(&code).await.unwrap(), "200,200,200");
        assert_eq!(server.requests().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_transport_failure_uncaught() {
        let url = closed_port_url().await;
        let err = run(&format!("return await fetch('{url}')")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Fetch(FetchError::Transport(_))), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_failure_catchable() {
        let url = closed_port_url().await;
        let code = format!("try {{ await fetch('{url}'); return 'no'; }} catch (e) {{ return e.name; }}");
        assert_eq!(run(&code).await.unwrap(), "TypeError");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_error_copying_fetch_message_stays_guest_exception() {
        let url = closed_port_url().await;
        let code = format!(
            "let m = ''; try {{ await fetch('{url}'); }} catch (e) {{ m = e.message; }} throw new TypeError(m);"
        );
        let err = run(&code).await.unwrap_err();
        assert!(
            matches!(err, SandboxError::GuestException(ref m) if m.starts_with("TypeError: ")),
            "got {err:?}"
        );

        // Rethrowing the rejection itself still reports the fetch failure
        let code = format!("try {{ await fetch('{url}'); }} catch (e) {{ throw e; }}");
        let err = run(&code).await.unwrap_err();
        assert!(matches!(err, SandboxError::Fetch(FetchError::Transport(_))), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_rejects_non_http_scheme() {
        let err = run("return await fetch('file:///etc/passwd')").await.unwrap_err();
        assert!(matches!(err, SandboxError::Fetch(FetchError::InvalidRequest(_))), "got {err:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_fetch_hits_deadline() {
        let server = StubServer::start(vec![StubResponse::ok("late").delayed(Duration::from_secs(5))]).await;
        let sandbox = sandbox_with(SandboxConfig {
            timeout_ms: 300,
            ..SandboxConfig::default()
        });
        let started = Instant::now();
        let code = format!("return (await fetch('{}')).status", server.url("/"));
        let err = sandbox.execute(SecretString::from(code)).await.unwrap_err();
        assert!(matches!(err, SandboxError::TimedOut(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    // ── JSONPath ────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn test_jsonpath_helper() {
        let code = r#"(async () => {
            const records = [
                { id: 1, text: "Hello, Earth!" },
                { id: 2, text: "Hello, Mars!" }
            ];
            const result = JSONPath.JSONPath({path: '$..text', json: records});
            return JSON.stringify(result);
        })()"#;
        assert_eq!(run(code).await.unwrap(), r#"["Hello, Earth!","Hello, Mars!"]"#);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_jsonpath_positional_and_errors() {
        assert_eq!(run("JSONPath('$.a[1]', {a: [5, 6]})").await.unwrap(), "[6]");
        assert_eq!(
            run("JSONPath('$[1::9223372036854775807]', [1, 2, 3])").await.unwrap(),
            "[2]"
        );
        let err = run("JSONPath({path: '$[?(@.a)]', json: []})").await.unwrap_err();
        assert!(matches!(err, SandboxError::GuestException(ref m) if m.starts_with("TypeError")), "got {err:?}");
    }
}
