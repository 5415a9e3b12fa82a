//! Arbitration for the motion-detection capture strategy.
//!
//! `CaptureCycle` owns the three-state cycle and decides what the capture
//! actor must do next. It never spawns anything itself, so at most one
//! capture process is in flight as long as the actor only acts on the
//! returned [`CycleAction`]s.

use crate::timebase::secs_to_us;
use log::{debug, info};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureCycleState {
    Idle,
    PendingMotionCapture,
    PendingFullCapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleAction {
    SpawnMotionCapture,
    SpawnFullCapture,
    /// Deliver `motion_timer_fired(generation)` after the delay.
    ScheduleMotionCapture { after: Duration, generation: u64 },
    AutoDisabled,
}

#[derive(Debug, Clone)]
pub struct CaptureCycle {
    state: CaptureCycleState,
    running: bool,
    started_us: Option<u64>,
    force_pending: bool,
    timer_generation: u64,
    interval: Duration,
    auto_disable_us: u64,
}

impl CaptureCycle {
    pub fn new(interval: Duration, auto_disable_secs: f64) -> Self {
        Self {
            state: CaptureCycleState::Idle,
            running: false,
            started_us: None,
            force_pending: false,
            timer_generation: 0,
            interval,
            auto_disable_us: secs_to_us(auto_disable_secs),
        }
    }

    pub fn state(&self) -> CaptureCycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn force_pending(&self) -> bool {
        self.force_pending
    }

    /// Enable motion capture. Restarts the auto-disable window even when
    /// already running.
    pub fn start_motion(&mut self, now_us: u64) -> Vec<CycleAction> {
        self.started_us = Some(now_us);
        if self.running {
            return Vec::new();
        }
        info!("Enabling camera motion capture");
        self.running = true;
        self.begin_motion()
    }

    pub fn stop_motion(&mut self) {
        if !self.running {
            return;
        }
        info!("Disabling camera motion capture");
        self.running = false;
        self.started_us = None;
    }

    pub fn force_capture(&mut self) -> Vec<CycleAction> {
        match self.state {
            CaptureCycleState::PendingFullCapture => {
                debug!("Full capture in progress; force capture not necessary");
                Vec::new()
            }
            CaptureCycleState::Idle => self.begin_full(),
            CaptureCycleState::PendingMotionCapture => {
                debug!("Full capture deferred until the motion capture completes");
                self.force_pending = true;
                Vec::new()
            }
        }
    }

    /// A scheduled motion timer expired. Stale timers are ignored.
    pub fn motion_timer_fired(&mut self, generation: u64) -> Vec<CycleAction> {
        if !self.running || generation != self.timer_generation {
            return Vec::new();
        }
        self.begin_motion()
    }

    /// The low-resolution capture finished. A failed capture reports
    /// `motion == false`.
    pub fn motion_completed(&mut self, motion: bool, now_us: u64) -> Vec<CycleAction> {
        if self.state != CaptureCycleState::PendingMotionCapture {
            return Vec::new();
        }
        self.state = CaptureCycleState::Idle;

        if self.force_pending {
            return self.begin_full();
        }
        if !self.running {
            return Vec::new();
        }
        if motion {
            info!("Motion detected; capturing image");
            return self.begin_full();
        }

        let elapsed = now_us.saturating_sub(self.started_us.unwrap_or(now_us));
        if elapsed < self.auto_disable_us {
            vec![self.schedule_motion()]
        } else {
            info!("Motion capture window elapsed; disabling");
            self.running = false;
            self.started_us = None;
            vec![CycleAction::AutoDisabled]
        }
    }

    /// The full capture finished, successfully or not.
    pub fn full_completed(&mut self) -> Vec<CycleAction> {
        if self.state != CaptureCycleState::PendingFullCapture {
            return Vec::new();
        }
        self.state = CaptureCycleState::Idle;
        if self.running {
            vec![self.schedule_motion()]
        } else {
            Vec::new()
        }
    }

    fn begin_motion(&mut self) -> Vec<CycleAction> {
        if self.state != CaptureCycleState::Idle {
            return Vec::new();
        }
        self.state = CaptureCycleState::PendingMotionCapture;
        vec![CycleAction::SpawnMotionCapture]
    }

    fn begin_full(&mut self) -> Vec<CycleAction> {
        self.state = CaptureCycleState::PendingFullCapture;
        self.force_pending = false;
        vec![CycleAction::SpawnFullCapture]
    }

    fn schedule_motion(&mut self) -> CycleAction {
        self.timer_generation += 1;
        CycleAction::ScheduleMotionCapture {
            after: self.interval,
            generation: self.timer_generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000;

    fn cycle() -> CaptureCycle {
        CaptureCycle::new(Duration::from_millis(500), 600.0)
    }

    fn scheduled(actions: &[CycleAction]) -> u64 {
        match actions {
            [CycleAction::ScheduleMotionCapture { generation, .. }] => *generation,
            other => panic!("expected a schedule, got {other:?}"),
        }
    }

    #[test]
    fn start_spawns_one_motion_capture() {
        let mut c = cycle();
        assert_eq!(c.start_motion(0), vec![CycleAction::SpawnMotionCapture]);
        assert!(c.start_motion(SEC).is_empty());
        assert_eq!(c.state(), CaptureCycleState::PendingMotionCapture);
    }

    #[test]
    fn quiet_frames_reschedule_until_window_ends() {
        let mut c = cycle();
        c.start_motion(0);
        let generation = scheduled(&c.motion_completed(false, SEC));
        assert_eq!(
            c.motion_timer_fired(generation),
            vec![CycleAction::SpawnMotionCapture]
        );
        assert_eq!(
            c.motion_completed(false, 600 * SEC),
            vec![CycleAction::AutoDisabled]
        );
        assert!(!c.is_running());
    }

    #[test]
    fn restart_extends_window() {
        let mut c = cycle();
        c.start_motion(0);
        c.start_motion(500 * SEC);
        let actions = c.motion_completed(false, 700 * SEC);
        scheduled(&actions);
    }

    #[test]
    fn motion_triggers_full_capture_then_resumes() {
        let mut c = cycle();
        c.start_motion(0);
        assert_eq!(
            c.motion_completed(true, SEC),
            vec![CycleAction::SpawnFullCapture]
        );
        scheduled(&c.full_completed());
        assert_eq!(c.state(), CaptureCycleState::Idle);
    }

    #[test]
    fn force_during_motion_yields_single_full_capture() {
        let mut c = cycle();
        c.start_motion(0);
        assert!(c.force_capture().is_empty());
        assert!(c.force_pending());

        // Motion was also detected; still only one full capture.
        assert_eq!(
            c.motion_completed(true, SEC),
            vec![CycleAction::SpawnFullCapture]
        );
        assert!(!c.force_pending());
        assert!(c.force_capture().is_empty());
    }

    #[test]
    fn force_when_idle_captures_immediately() {
        let mut c = cycle();
        assert_eq!(c.force_capture(), vec![CycleAction::SpawnFullCapture]);
        assert!(c.full_completed().is_empty());
    }

    #[test]
    fn timers_after_stop_are_ignored() {
        let mut c = cycle();
        c.start_motion(0);
        let generation = scheduled(&c.motion_completed(false, SEC));
        c.stop_motion();
        assert!(c.motion_timer_fired(generation).is_empty());
        assert_eq!(c.state(), CaptureCycleState::Idle);
    }

    #[test]
    fn superseded_timers_are_ignored() {
        let mut c = cycle();
        c.start_motion(0);
        let stale = scheduled(&c.motion_completed(false, SEC));
        c.force_capture();
        let fresh = scheduled(&c.full_completed());
        assert!(c.motion_timer_fired(stale).is_empty());
        assert_eq!(
            c.motion_timer_fired(fresh),
            vec![CycleAction::SpawnMotionCapture]
        );
    }

    #[test]
    fn stopped_cycle_still_honours_deferred_force() {
        let mut c = cycle();
        c.start_motion(0);
        c.force_capture();
        c.stop_motion();
        assert_eq!(
            c.motion_completed(false, SEC),
            vec![CycleAction::SpawnFullCapture]
        );
        assert!(c.full_completed().is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Stop,
        Force,
        Timer,
        StaleTimer,
        Complete(bool),
        Advance(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Force),
            Just(Op::Timer),
            Just(Op::StaleTimer),
            any::<bool>().prop_map(Op::Complete),
            (0u64..120_000_000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_capture_in_flight(ops in proptest::collection::vec(op(), 1..200)) {
            let mut cycle = CaptureCycle::new(Duration::from_millis(500), 600.0);
            let mut now = 0u64;
            let mut in_flight: Option<CycleAction> = None;
            let mut latest_generation = 0u64;

            for op in ops {
                let actions = match op {
                    Op::Start => cycle.start_motion(now),
                    Op::Stop => { cycle.stop_motion(); Vec::new() }
                    Op::Force => cycle.force_capture(),
                    Op::Timer => cycle.motion_timer_fired(latest_generation),
                    Op::StaleTimer => cycle.motion_timer_fired(latest_generation.wrapping_sub(1)),
                    Op::Complete(motion) => match in_flight.take() {
                        Some(CycleAction::SpawnMotionCapture) => cycle.motion_completed(motion, now),
                        Some(CycleAction::SpawnFullCapture) => cycle.full_completed(),
                        _ => Vec::new(),
                    },
                    Op::Advance(us) => { now += us; Vec::new() }
                };

                for action in actions {
                    match action {
                        CycleAction::SpawnMotionCapture | CycleAction::SpawnFullCapture => {
                            prop_assert!(in_flight.is_none(), "second spawn while {:?} in flight", in_flight);
                            in_flight = Some(action);
                        }
                        CycleAction::ScheduleMotionCapture { generation, .. } => {
                            prop_assert!(generation > latest_generation);
                            latest_generation = generation;
                        }
                        CycleAction::AutoDisabled => prop_assert!(!cycle.is_running()),
                    }
                }

                let expected = match in_flight {
                    None => CaptureCycleState::Idle,
                    Some(CycleAction::SpawnMotionCapture) => CaptureCycleState::PendingMotionCapture,
                    Some(_) => CaptureCycleState::PendingFullCapture,
                };
                prop_assert_eq!(cycle.state(), expected);
                if cycle.force_pending() {
                    prop_assert_eq!(cycle.state(), CaptureCycleState::PendingMotionCapture);
                }
            }
        }
    }
}
