use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use stairled_driver::throttle::Throttle;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::output::LightOutput;
use crate::registry::AnimationRegistry;
use crate::timeline::Timeline;

const COMMAND_QUEUE: usize = 16;
const MISSED_TICK_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopping,
}

impl EngineState {
    fn as_u8(self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Running => 1,
            EngineState::Stopping => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub tick_hz: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { tick_hz: 60 }
    }
}

enum Command {
    Start {
        name: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Async control surface over the engine thread. The dispatcher talks to
/// this trait so tests can substitute the engine.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Arms and starts a named animation. `Busy` while one is running.
    async fn start(&self, name: &str) -> Result<(), EngineError>;

    /// Cooperative stop, effective at the next tick boundary.
    async fn stop(&self) -> Result<(), EngineError>;
}

/// Cheap cloneable handle; commands cross into the engine thread over a
/// bounded channel, replies come back per command.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl EngineControl for EngineHandle {
    async fn start(&self, name: &str) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::Unavailable("engine thread is gone".into()))?;
        response
            .await
            .map_err(|_| EngineError::Unavailable("engine dropped the request".into()))?
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| EngineError::Unavailable("engine thread is gone".into()))?;
        response
            .await
            .map_err(|_| EngineError::Unavailable("engine dropped the request".into()))?;
        Ok(())
    }
}

struct Run {
    name: String,
    timeline: Timeline,
}

/// The frame scheduler. Owns the single active timeline, evaluates it at
/// the tick rate and writes merged frames to the output.
///
/// Single-flight: at most one animation runs; `start` during a run answers
/// `Busy`. The dispatcher enforces the same policy above this layer, the
/// engine enforces it defensively.
pub struct Engine<O: LightOutput> {
    registry: Arc<AnimationRegistry>,
    output: Arc<O>,
    clock: Arc<dyn Clock>,
    commands: mpsc::Receiver<Command>,
    shared_state: Arc<AtomicU8>,
    state: EngineState,
    current: Option<Run>,
    tick: Duration,
    missed_tick_log: Throttle,
}

impl<O: LightOutput + 'static> Engine<O> {
    /// Spawns the engine loop on its own thread and returns the handle.
    pub fn spawn(
        registry: Arc<AnimationRegistry>,
        output: Arc<O>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> std::io::Result<EngineHandle> {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let shared_state = Arc::new(AtomicU8::new(EngineState::Idle.as_u8()));
        let engine = Engine::new(registry, output, clock, config, receiver, shared_state.clone());
        thread::Builder::new()
            .name("animation-engine".into())
            .spawn(move || engine.run())?;
        Ok(EngineHandle {
            commands,
            state: shared_state,
        })
    }

    fn new(
        registry: Arc<AnimationRegistry>,
        output: Arc<O>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        commands: mpsc::Receiver<Command>,
        shared_state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            registry,
            output,
            clock,
            commands,
            shared_state,
            state: EngineState::Idle,
            current: None,
            tick: Duration::from_millis(1000 / config.tick_hz.max(1) as u64),
            missed_tick_log: Throttle::new(MISSED_TICK_LOG_INTERVAL),
        }
    }

    fn run(mut self) {
        let mut next_deadline = Instant::now();
        loop {
            match self.state {
                EngineState::Idle => match self.commands.blocking_recv() {
                    Some(command) => {
                        self.handle(command);
                        if self.state == EngineState::Running {
                            next_deadline = Instant::now() + self.tick;
                        }
                    }
                    None => break,
                },
                EngineState::Running => {
                    // drain commands first so stop() lands on a tick boundary
                    while let Ok(command) = self.commands.try_recv() {
                        self.handle(command);
                    }
                    self.advance(self.clock.now_ms());
                    if self.state != EngineState::Running {
                        continue;
                    }

                    let now = Instant::now();
                    if now > next_deadline + self.tick {
                        // behind by more than a period: skip, don't catch up
                        if self.missed_tick_log.allow() {
                            warn!(
                                "engine missed tick deadline by {:?}, skipping ahead",
                                now - next_deadline
                            );
                        }
                        next_deadline = now;
                    }
                    if let Some(wait) = next_deadline.checked_duration_since(now) {
                        thread::sleep(wait);
                    }
                    next_deadline += self.tick;
                }
                EngineState::Stopping => self.advance(self.clock.now_ms()),
            }
        }
        // channel closed: make sure the stairs go dark
        self.output.clear_all();
    }

    /// One scheduler step at `now_ms`: tick the timeline, write the merged
    /// frame, finish the run once the timeline's end is behind us. All PWM
    /// writes for this tick complete before the next tick begins.
    fn advance(&mut self, now_ms: u64) {
        match self.state {
            EngineState::Idle => {}
            EngineState::Running => {
                let Some(run) = self.current.as_mut() else {
                    self.set_state(EngineState::Idle);
                    return;
                };
                run.timeline.set_current(now_ms, self.output.as_ref());
                let merged = run.timeline.render_active();
                if !merged.is_empty() {
                    self.output.apply_frame(&merged);
                }
                if run
                    .timeline
                    .absolute_end()
                    .is_some_and(|end| now_ms > end)
                {
                    debug!("animation {:?} finished", run.name);
                    self.set_state(EngineState::Stopping);
                }
            }
            EngineState::Stopping => {
                self.output.clear_all();
                self.current = None;
                self.set_state(EngineState::Idle);
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { name, reply } => {
                let _ = reply.send(self.start(name));
            }
            Command::Stop { reply } => {
                if self.state == EngineState::Running {
                    self.set_state(EngineState::Stopping);
                }
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, name: String) -> Result<(), EngineError> {
        if self.state != EngineState::Idle {
            return Err(EngineError::Busy);
        }
        let named = self
            .registry
            .get(&name)
            .ok_or_else(|| EngineError::NotFound { name: name.clone() })?;
        let mut timeline = named.instantiate();
        timeline.set_absolute_start(self.clock.now_ms());
        info!(
            "starting animation {:?} ({} ms)",
            name,
            timeline.duration_ms()
        );
        self.current = Some(Run { name, timeline });
        self.set_state(EngineState::Running);
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) {
        self.state = state;
        self.shared_state.store(state.as_u8(), Ordering::SeqCst);
    }
}
