//! Automation controller: one state machine per (device, actuator) deciding
//! when to start and stop irrigation/fertilizer cycles.
//!
//! ## Per-actuator state machine
//!
//! ```text
//! Idle ──[band needs actuation]──▶ PendingOn ──[delivered]──▶ Active
//!  ▲                                   │                        │
//!  │          [delivery failed twice:  │     [duration elapsed  │
//!  │           hold, re-evaluate on    │      or recovery to    │
//!  │           next classification]────┘      OPTIMAL]          │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! An orthogonal override window suppresses automated ON commands for a
//! fixed period after any observed MANUAL command.  Duration elapse and
//! override expiry are stored deadlines evaluated by the tick loop, so a
//! live classification update can preempt them deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn};

use crate::classify::{Band, Dimension, Outcome};
use crate::mqtt::{ActuatorCommand, Actuator, CommandAction, CommandSink, TriggeredBy};
use crate::registry::SharedState;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AutomationSettings {
    pub water_duration_secs: u64,
    pub fertilizer_duration_secs: u64,
    pub override_secs: u64,
    pub retry_backoff_ms: u64,
    /// WATER cycles are vetoed while the rain probability is at or above
    /// this threshold.
    pub rain_veto_threshold: f64,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            water_duration_secs: 300,
            fertilizer_duration_secs: 600,
            override_secs: 3600,
            retry_backoff_ms: 500,
            rain_veto_threshold: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Machine state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum MachineState {
    Idle,
    /// Delivery attempted and failed; held here until the next
    /// classification re-evaluates the need.
    PendingOn { trigger: Dimension },
    Active {
        /// OFF deadline; `None` for a manual ON without a duration.
        until: Option<Instant>,
        /// Dimension whose recovery ends the cycle early; `None` when the
        /// cycle was started manually.
        trigger: Option<Dimension>,
    },
}

impl MachineState {
    fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "IDLE",
            MachineState::PendingOn { .. } => "PENDING_ON",
            MachineState::Active { .. } => "ACTIVE",
        }
    }
}

#[derive(Debug)]
struct ActuatorMachine {
    state: MachineState,
    override_until: Option<Instant>,
}

impl Default for ActuatorMachine {
    fn default() -> Self {
        Self {
            state: MachineState::Idle,
            override_until: None,
        }
    }
}

impl ActuatorMachine {
    fn overridden(&self, now: Instant) -> bool {
        self.override_until.is_some_and(|t| now < t)
    }
}

/// Snapshot of one machine, as returned by the query API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorStatus {
    pub actuator: Actuator,
    pub state: &'static str,
    pub overridden: bool,
    pub override_remaining_secs: Option<u64>,
    pub active_remaining_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Trigger policy
// ---------------------------------------------------------------------------

/// Dimension whose current band requests this actuator, if any.
fn needs_actuation(actuator: Actuator, outcomes: &[Outcome]) -> Option<Dimension> {
    match actuator {
        Actuator::Water => outcomes
            .iter()
            .find(|o| {
                o.dimension == Dimension::Moisture
                    && matches!(o.band, Band::Critical | Band::Poor)
            })
            .map(|o| o.dimension),
        Actuator::Fertilizer => outcomes
            .iter()
            .find(|o| {
                matches!(
                    o.dimension,
                    Dimension::Nitrogen | Dimension::Phosphorus | Dimension::Potassium
                ) && o.band == Band::Low
            })
            .map(|o| o.dimension),
    }
}

fn recovered(trigger: Dimension, outcomes: &[Outcome]) -> bool {
    outcomes
        .iter()
        .any(|o| o.dimension == trigger && o.band == Band::Optimal)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Automation<S: CommandSink> {
    sink: S,
    settings: AutomationSettings,
    /// Live rain probability from the weather poller.
    rain: watch::Receiver<f64>,
    shared: SharedState,
    /// One lock per machine, behind a short-lived registry lock.  Mutation
    /// of a (device, actuator) state is serialized on its own lock, held
    /// across command delivery; other machines proceed independently even
    /// while one sits in a retry backoff.
    machines: Mutex<HashMap<(String, Actuator), Arc<Mutex<ActuatorMachine>>>>,
}

impl<S: CommandSink> Automation<S> {
    pub fn new(
        sink: S,
        settings: AutomationSettings,
        rain: watch::Receiver<f64>,
        shared: SharedState,
    ) -> Self {
        Self {
            sink,
            settings,
            rain,
            shared,
            machines: Mutex::new(HashMap::new()),
        }
    }

    fn on_duration(&self, actuator: Actuator) -> u64 {
        match actuator {
            Actuator::Water => self.settings.water_duration_secs,
            Actuator::Fertilizer => self.settings.fertilizer_duration_secs,
        }
    }

    fn rain_vetoed(&self) -> bool {
        *self.rain.borrow() >= self.settings.rain_veto_threshold
    }

    /// Fetch (or create) the lock for one machine.  The registry lock is
    /// released before the caller locks the machine itself.
    async fn machine(&self, device_id: &str, actuator: Actuator) -> Arc<Mutex<ActuatorMachine>> {
        let mut machines = self.machines.lock().await;
        Arc::clone(
            machines
                .entry((device_id.to_string(), actuator))
                .or_default(),
        )
    }

    /// Evaluate fresh classifications for a device.  Called from that
    /// device's ingestion worker, so calls for one device arrive in order.
    pub async fn on_classification(&self, device_id: &str, outcomes: &[Outcome]) {
        if outcomes.is_empty() {
            return;
        }
        for actuator in Actuator::ALL {
            self.evaluate(device_id, actuator, outcomes).await;
        }
    }

    async fn evaluate(&self, device_id: &str, actuator: Actuator, outcomes: &[Outcome]) {
        let cell = self.machine(device_id, actuator).await;
        let mut machine = cell.lock().await;
        let machine = &mut *machine;
        let now = Instant::now();
        expire_override(machine, now);

        match machine.state {
            MachineState::Active {
                trigger: Some(trigger),
                ..
            } if !machine.overridden(now) && recovered(trigger, outcomes) => {
                // Early recovery preempts the duration timer.
                info!(
                    device = device_id,
                    actuator = actuator.as_str(),
                    "recovered to OPTIMAL, ending cycle early"
                );
                self.issue_off(device_id, actuator, machine).await;
            }
            MachineState::Active { .. } => {}
            MachineState::Idle => {
                let Some(trigger) = needs_actuation(actuator, outcomes) else {
                    return;
                };
                if machine.overridden(now) {
                    return; // manual override window suppresses automation
                }
                if actuator == Actuator::Water && self.rain_vetoed() {
                    info!(device = device_id, "rain expected, water cycle vetoed");
                    return;
                }
                self.issue_on(device_id, actuator, trigger, machine).await;
            }
            MachineState::PendingOn { trigger } => {
                // Stalled delivery: re-evaluate the need before retrying.
                if recovered(trigger, outcomes) || needs_actuation(actuator, outcomes).is_none() {
                    machine.state = MachineState::Idle;
                    return;
                }
                if machine.overridden(now) || (actuator == Actuator::Water && self.rain_vetoed()) {
                    return;
                }
                self.issue_on(device_id, actuator, trigger, machine).await;
            }
        }
    }

    /// Apply an externally observed MANUAL command: mirror the actuator
    /// state and open the override window.  A new manual command restarts
    /// the window.
    pub async fn on_manual_command(&self, cmd: &ActuatorCommand) {
        let cell = self.machine(&cmd.device_id, cmd.actuator).await;
        let mut machine = cell.lock().await;
        let now = Instant::now();

        machine.override_until = Some(now + Duration::from_secs(self.settings.override_secs));
        machine.state = match cmd.action {
            CommandAction::On => MachineState::Active {
                until: (cmd.duration_secs > 0)
                    .then(|| now + Duration::from_secs(cmd.duration_secs)),
                trigger: None,
            },
            CommandAction::Off => MachineState::Idle,
        };

        let mut st = self.shared.write().await;
        st.record_automation(format!(
            "{}: manual {:?} {:?}, override window started",
            cmd.device_id, cmd.actuator, cmd.action
        ));
    }

    /// Fire expired duration timers and clear expired override windows.
    pub async fn tick(&self) {
        let now = Instant::now();
        let cells: Vec<((String, Actuator), Arc<Mutex<ActuatorMachine>>)> = {
            let machines = self.machines.lock().await;
            machines
                .iter()
                .map(|(key, cell)| (key.clone(), Arc::clone(cell)))
                .collect()
        };

        for ((device, actuator), cell) in cells {
            let mut machine = cell.lock().await;
            if machine.override_until.is_some_and(|t| now >= t) {
                machine.override_until = None;
                info!(
                    device = %device,
                    actuator = actuator.as_str(),
                    "manual override window expired"
                );
            }
            if let MachineState::Active { until: Some(t), .. } = machine.state {
                if now >= t {
                    info!(
                        device = %device,
                        actuator = actuator.as_str(),
                        "duration elapsed, turning off"
                    );
                    self.issue_off(&device, actuator, &mut machine).await;
                }
            }
        }
    }

    /// Run the tick loop.  Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self: Arc<Self>, tick_interval: Duration) {
        let mut ticker = interval(tick_interval);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Current machine states for one device (query API).
    pub async fn snapshot(&self, device_id: &str) -> Vec<ActuatorStatus> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(Actuator::ALL.len());
        for actuator in Actuator::ALL {
            let cell = {
                let machines = self.machines.lock().await;
                machines.get(&(device_id.to_string(), actuator)).cloned()
            };
            let (state, active_remaining, override_remaining) = match cell {
                Some(cell) => {
                    let machine = cell.lock().await;
                    let (state, active_remaining) = match machine.state {
                        MachineState::Active { until, .. } => (
                            "ACTIVE",
                            until.map(|t| t.saturating_duration_since(now).as_secs()),
                        ),
                        s => (s.as_str(), None),
                    };
                    let override_remaining = machine
                        .override_until
                        .filter(|t| *t > now)
                        .map(|t| t.saturating_duration_since(now).as_secs());
                    (state, active_remaining, override_remaining)
                }
                None => ("IDLE", None, None),
            };
            out.push(ActuatorStatus {
                actuator,
                state,
                overridden: override_remaining.is_some(),
                override_remaining_secs: override_remaining,
                active_remaining_secs: active_remaining,
            });
        }
        out
    }

    // -- command delivery --------------------------------------------------

    async fn issue_on(
        &self,
        device_id: &str,
        actuator: Actuator,
        trigger: Dimension,
        machine: &mut ActuatorMachine,
    ) {
        machine.state = MachineState::PendingOn { trigger };

        let duration = self.on_duration(actuator);
        let cmd = ActuatorCommand {
            device_id: device_id.to_string(),
            actuator,
            action: CommandAction::On,
            duration_secs: duration,
            triggered_by: TriggeredBy::AiSystem,
            issued_at: OffsetDateTime::now_utc(),
        };

        if self.deliver(&cmd).await {
            machine.state = MachineState::Active {
                until: Some(Instant::now() + Duration::from_secs(duration)),
                trigger: Some(trigger),
            };
            let mut st = self.shared.write().await;
            st.record_automation(format!(
                "{device_id}: {} ON for {duration}s ({} below optimal)",
                actuator.as_str(),
                trigger.as_str()
            ));
        } else {
            // Held at PendingOn; the next classification re-evaluates.
            warn!(
                device = device_id,
                actuator = actuator.as_str(),
                "ON delivery failed twice, automation stalled"
            );
            let mut st = self.shared.write().await;
            st.record_warning(format!(
                "{device_id}: {} ON delivery failed twice, automation stalled",
                actuator.as_str()
            ));
        }
    }

    async fn issue_off(
        &self,
        device_id: &str,
        actuator: Actuator,
        machine: &mut ActuatorMachine,
    ) {
        let cmd = ActuatorCommand {
            device_id: device_id.to_string(),
            actuator,
            action: CommandAction::Off,
            duration_secs: 0,
            triggered_by: TriggeredBy::AiSystem,
            issued_at: OffsetDateTime::now_utc(),
        };

        if !self.deliver(&cmd).await {
            error!(
                device = device_id,
                actuator = actuator.as_str(),
                "OFF delivery failed twice"
            );
            let mut st = self.shared.write().await;
            st.record_error(format!(
                "{device_id}: {} OFF delivery failed",
                actuator.as_str()
            ));
        }
        // The cycle is over either way; the state machine owns the truth.
        machine.state = MachineState::Idle;
    }

    /// Deliver with a single retry after a short backoff.
    async fn deliver(&self, cmd: &ActuatorCommand) -> bool {
        match self.sink.send(cmd).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %cmd.device_id, "command delivery failed: {e}, retrying once");
                sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
                match self.sink.send(cmd).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(device = %cmd.device_id, "command delivery retry failed: {e}");
                        false
                    }
                }
            }
        }
    }
}

fn expire_override(machine: &mut ActuatorMachine, now: Instant) {
    if machine.override_until.is_some_and(|t| now >= t) {
        machine.override_until = None;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records every command; fails the first `fail_first` sends.
    #[derive(Clone, Default)]
    struct MockSink {
        sent: Arc<StdMutex<Vec<ActuatorCommand>>>,
        fail_first: Arc<AtomicUsize>,
    }

    impl MockSink {
        fn sent(&self) -> Vec<ActuatorCommand> {
            self.sent.lock().unwrap().clone()
        }

        fn fail_next(&self, n: usize) {
            self.fail_first.store(n, Ordering::SeqCst);
        }
    }

    impl CommandSink for MockSink {
        fn send(
            &self,
            cmd: &ActuatorCommand,
        ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
            let cmd = cmd.clone();
            let sent = Arc::clone(&self.sent);
            let fail = Arc::clone(&self.fail_first);
            async move {
                if fail
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(anyhow!("simulated delivery failure"));
                }
                sent.lock().unwrap().push(cmd);
                Ok(())
            }
        }
    }

    fn controller(sink: MockSink) -> Automation<MockSink> {
        controller_with_rain(sink, 0.0)
    }

    fn controller_with_rain(sink: MockSink, rain: f64) -> Automation<MockSink> {
        // A dropped sender leaves the last value readable via borrow().
        let (_tx, rx) = watch::channel(rain);
        Automation::new(sink, AutomationSettings::default(), rx, registry::shared())
    }

    fn moisture_outcome(band: Band) -> Vec<Outcome> {
        vec![Outcome {
            dimension: Dimension::Moisture,
            value: 0.0,
            band,
            from: None,
        }]
    }

    fn nitrogen_outcome(band: Band) -> Vec<Outcome> {
        vec![Outcome {
            dimension: Dimension::Nitrogen,
            value: 0.0,
            band,
            from: None,
        }]
    }

    fn manual(action: CommandAction, duration: u64) -> ActuatorCommand {
        ActuatorCommand {
            device_id: "d1".into(),
            actuator: Actuator::Water,
            action,
            duration_secs: duration,
            triggered_by: TriggeredBy::Manual,
            issued_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    // -- triggering --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn poor_moisture_starts_water_cycle() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].actuator, Actuator::Water);
        assert_eq!(sent[0].action, CommandAction::On);
        assert_eq!(sent[0].triggered_by, TriggeredBy::AiSystem);
        assert_eq!(sent[0].duration_secs, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn active_cycle_never_doubles_on() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        auto.on_classification("d1", &moisture_outcome(Band::Critical)).await;
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;

        let ons: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|c| c.action == CommandAction::On)
            .collect();
        assert_eq!(ons.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn optimal_moisture_does_not_trigger() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Optimal)).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn low_nitrogen_starts_fertilizer_cycle() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &nitrogen_outcome(Band::Low)).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].actuator, Actuator::Fertilizer);
        assert_eq!(sent[0].duration_secs, 600);
    }

    // -- timers ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn duration_elapse_turns_off() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        auto.tick().await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].action, CommandAction::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_before_deadline_does_nothing() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        tokio::time::advance(Duration::from_secs(100)).await;
        auto.tick().await;

        assert_eq!(sink.sent().len(), 1); // only the ON
    }

    #[tokio::test(start_paused = true)]
    async fn early_recovery_preempts_duration_timer() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        // duration=300; recovery arrives at t=120.
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        tokio::time::advance(Duration::from_secs(120)).await;
        auto.on_classification("d1", &moisture_outcome(Band::Optimal)).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].action, CommandAction::Off);

        // The original deadline must not fire a second OFF at t=300.
        tokio::time::advance(Duration::from_secs(300)).await;
        auto.tick().await;
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_can_restart_after_off_when_still_dry() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        auto.tick().await;

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        let ons: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|c| c.action == CommandAction::On)
            .collect();
        assert_eq!(ons.len(), 2);
    }

    // -- rain veto ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rain_forecast_vetoes_water_cycle() {
        let sink = MockSink::default();
        let auto = controller_with_rain(sink.clone(), 0.9);

        auto.on_classification("d1", &moisture_outcome(Band::Critical)).await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rain_does_not_veto_fertilizer() {
        let sink = MockSink::default();
        let auto = controller_with_rain(sink.clone(), 0.9);

        auto.on_classification("d1", &nitrogen_outcome(Band::Low)).await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0].actuator, Actuator::Fertilizer);
    }

    // -- manual override ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn manual_on_suppresses_automation_within_window() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_manual_command(&manual(CommandAction::On, 600)).await;
        // Manual cycle ends; override is still open.
        tokio::time::advance(Duration::from_secs(700)).await;
        auto.tick().await;

        auto.on_classification("d1", &moisture_outcome(Band::Critical)).await;
        // Only the timer OFF went out; no AI ON during the override window.
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, CommandAction::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn automation_resumes_after_override_expires() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_manual_command(&manual(CommandAction::On, 600)).await;
        tokio::time::advance(Duration::from_secs(700)).await;
        auto.tick().await; // manual duration OFF

        // Wall clock passes the 60-minute window.
        tokio::time::advance(Duration::from_secs(3600)).await;
        auto.tick().await;

        auto.on_classification("d1", &moisture_outcome(Band::Critical)).await;
        let ons: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|c| c.action == CommandAction::On && c.triggered_by == TriggeredBy::AiSystem)
            .collect();
        assert_eq!(ons.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_on_with_duration_gets_timer_off() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_manual_command(&manual(CommandAction::On, 120)).await;
        tokio::time::advance(Duration::from_secs(121)).await;
        auto.tick().await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, CommandAction::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_off_forces_idle_and_overrides() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        auto.on_manual_command(&manual(CommandAction::Off, 0)).await;

        // Still dry, but the operator said off.
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        let ons: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|c| c.action == CommandAction::On)
            .collect();
        assert_eq!(ons.len(), 1); // only the pre-override one
    }

    #[tokio::test(start_paused = true)]
    async fn new_manual_command_restarts_override_window() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_manual_command(&manual(CommandAction::Off, 0)).await;
        tokio::time::advance(Duration::from_secs(3000)).await;
        // Second manual command resets the 3600 s window.
        auto.on_manual_command(&manual(CommandAction::Off, 0)).await;
        tokio::time::advance(Duration::from_secs(3000)).await;
        auto.tick().await;

        auto.on_classification("d1", &moisture_outcome(Band::Critical)).await;
        assert!(sink.sent().is_empty(), "override should still be open");
    }

    // -- delivery failure --------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_holds_pending_and_recovers_on_next_tick() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        sink.fail_next(2); // first attempt and its retry both fail
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        assert!(sink.sent().is_empty());
        assert_eq!(auto.snapshot("d1").await[0].state, "PENDING_ON");

        // Next classification re-evaluates the need and retries.
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, CommandAction::On);
        assert_eq!(auto.snapshot("d1").await[0].state, "ACTIVE");
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_recovered_by_retry() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        sink.fail_next(1);
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(auto.snapshot("d1").await[0].state, "ACTIVE");
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_backoff_on_one_device_does_not_stall_others() {
        let sink = MockSink::default();
        let auto = Arc::new(controller(sink.clone()));

        // Device A's ON fails on both attempts, so its machine sits in the
        // retry backoff for retry_backoff_ms.
        sink.fail_next(2);
        let stalled = Arc::clone(&auto);
        let stalled_task = tokio::spawn(async move {
            stalled
                .on_classification("dA", &moisture_outcome(Band::Poor))
                .await;
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // Device B's evaluation must complete without waiting out A's
        // backoff: on the paused clock, any wait would advance time.
        let before = Instant::now();
        auto.on_classification("dB", &moisture_outcome(Band::Optimal))
            .await;
        assert_eq!(
            Instant::now(),
            before,
            "evaluation for dB waited on dA's delivery backoff"
        );

        stalled_task.await.unwrap();
        assert_eq!(auto.snapshot("dA").await[0].state, "PENDING_ON");
        assert_eq!(auto.snapshot("dB").await[0].state, "IDLE");
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_delivery_records_warning_event() {
        let sink = MockSink::default();
        let shared = registry::shared();
        let (_tx, rain) = watch::channel(0.0);
        let auto = Automation::new(
            sink.clone(),
            AutomationSettings::default(),
            rain,
            Arc::clone(&shared),
        );

        sink.fail_next(2);
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;

        let st = shared.read().await;
        assert!(st.events.iter().any(|e| {
            matches!(e.kind, crate::registry::EventKind::Warning)
                && e.detail.contains("ON delivery failed twice")
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_cleared_when_need_disappears() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        sink.fail_next(2);
        auto.on_classification("d1", &moisture_outcome(Band::Poor)).await;
        assert_eq!(auto.snapshot("d1").await[0].state, "PENDING_ON");

        auto.on_classification("d1", &moisture_outcome(Band::Optimal)).await;
        assert_eq!(auto.snapshot("d1").await[0].state, "IDLE");
        assert!(sink.sent().is_empty());
    }

    // -- snapshot ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_override_and_remaining_time() {
        let sink = MockSink::default();
        let auto = controller(sink.clone());

        auto.on_manual_command(&manual(CommandAction::On, 600)).await;
        let snap = auto.snapshot("d1").await;

        let water = snap.iter().find(|s| s.actuator == Actuator::Water).unwrap();
        assert_eq!(water.state, "ACTIVE");
        assert!(water.overridden);
        assert!(water.override_remaining_secs.unwrap() <= 3600);
        assert!(water.active_remaining_secs.unwrap() <= 600);

        let fert = snap
            .iter()
            .find(|s| s.actuator == Actuator::Fertilizer)
            .unwrap();
        assert_eq!(fert.state, "IDLE");
        assert!(!fert.overridden);
    }
}
