//! Running-state transitions

use super::{FaultConditions, RunningState};
use crate::config::ModeConfig;
use crate::snapshot::{BrakePedal, StateSnapshot};

use RunningState::*;

/// Conditions shared by several transitions, computed once per cycle.
struct Inputs {
    rpm: u32,
    shaft_rpm: u32,
    pedal: u32,
    pedal_closed: bool,
    brake: bool,
    stationary: bool,
    in_gear: bool,
    driving: bool,
    warm: bool,
    shift_cut: bool,
    launch_requested: bool,
}

impl Inputs {
    fn new(s: &StateSnapshot, cfg: &ModeConfig) -> Self {
        let d = &s.driver;
        let trans = &s.transmission;
        let stationary = s.is_stationary(cfg.stationary_shaft_rpm);
        let in_gear = trans.gear.is_forward();
        Self {
            rpm: s.crank_speed,
            shaft_rpm: trans.output_shaft_speed,
            pedal: d.pedal,
            pedal_closed: d.pedal <= cfg.idle_pedal,
            brake: d.brake == BrakePedal::Pressed,
            stationary,
            in_gear,
            driving: in_gear && (trans.clutch.is_engaged() || !stationary),
            warm: s.coolant_out_temp >= cfg.warm_coolant,
            shift_cut: d.upshift_pressed && d.upshift_press_duration < cfg.shift_cut_ms,
            launch_requested: d.launch_requested,
        }
    }

    fn idle(&self) -> RunningState {
        if self.driving {
            RunningIdleDriving
        } else {
            RunningIdleFree
        }
    }
}

/// Running state for this cycle. At most one transition per call.
pub(super) fn next(
    current: RunningState,
    snapshot: &StateSnapshot,
    faults: &FaultConditions,
    cfg: &ModeConfig,
) -> RunningState {
    let i = Inputs::new(snapshot, cfg);

    match current {
        Stopped => {
            if i.rpm >= cfg.cranking_rpm {
                StoppedPrepping
            } else {
                Stopped
            }
        }
        StoppedPrepping => {
            if i.rpm == 0 {
                Stopped
            } else if i.rpm >= cfg.start_rpm {
                i.idle()
            } else {
                StoppedPrepping
            }
        }
        StoppedDied => {
            if i.rpm >= cfg.cranking_rpm {
                StoppedPrepping
            } else if i.rpm == 0 {
                Stopped
            } else {
                StoppedDied
            }
        }
        StoppedAutostop => {
            if !i.brake || !i.pedal_closed {
                StoppedPrepping
            } else {
                StoppedAutostop
            }
        }
        running => {
            if i.rpm < cfg.stall_rpm {
                StoppedDied
            } else if faults.sustained_overrun {
                RunningCompleteCut
            } else {
                next_running(running, &i, cfg)
            }
        }
    }
}

fn next_running(current: RunningState, i: &Inputs, cfg: &ModeConfig) -> RunningState {
    let soft_release = cfg.soft_limit_rpm.saturating_sub(cfg.limiter_hysteresis_rpm);
    let hard_release = cfg.hard_limit_rpm.saturating_sub(cfg.limiter_hysteresis_rpm);

    match current {
        RunningCompleteCut => RunningNormal,

        RunningIdleFree | RunningIdleDriving => {
            if i.launch_requested && i.stationary && i.brake {
                RunningLaunchPrep
            } else if current == RunningIdleDriving
                && i.stationary
                && i.brake
                && i.warm
                && cfg.autostop_enabled
            {
                StoppedAutostop
            } else if !i.pedal_closed || i.rpm > cfg.idle_exit_rpm {
                RunningNormal
            } else {
                i.idle()
            }
        }

        RunningNormal => {
            if i.rpm >= cfg.soft_limit_rpm {
                RunningSoftLimiter
            } else if i.shift_cut {
                RunningIgnitionCut
            } else if i.pedal_closed && i.in_gear && i.rpm > cfg.decel_fuel_cut_rpm {
                RunningFuelCut
            } else if i.pedal_closed && i.rpm <= cfg.idle_exit_rpm {
                i.idle()
            } else {
                RunningNormal
            }
        }

        RunningSoftLimiter => {
            if i.rpm >= cfg.hard_limit_rpm {
                RunningHardLimiter
            } else if i.rpm < soft_release {
                RunningNormal
            } else {
                RunningSoftLimiter
            }
        }

        RunningHardLimiter => {
            if i.rpm < hard_release {
                RunningSoftLimiter
            } else {
                RunningHardLimiter
            }
        }

        RunningIgnitionCut => {
            if i.shift_cut {
                RunningIgnitionCut
            } else {
                RunningNormal
            }
        }

        RunningFuelCut => {
            if !i.pedal_closed || i.rpm < cfg.decel_fuel_resume_rpm {
                RunningNormal
            } else {
                RunningFuelCut
            }
        }

        RunningLaunchPrep => {
            if !i.launch_requested {
                i.idle()
            } else if i.pedal >= cfg.launch_pedal {
                RunningLaunchLimit
            } else {
                RunningLaunchPrep
            }
        }

        RunningLaunchLimit => {
            if !i.launch_requested {
                i.idle()
            } else if !i.brake {
                RunningLaunchStart
            } else if i.pedal < cfg.launch_pedal {
                RunningLaunchPrep
            } else {
                RunningLaunchLimit
            }
        }

        RunningLaunchStart => {
            if i.pedal_closed || i.shaft_rpm >= cfg.launch_complete_shaft_rpm {
                RunningNormal
            } else {
                RunningLaunchStart
            }
        }

        stopped => stopped,
    }
}
