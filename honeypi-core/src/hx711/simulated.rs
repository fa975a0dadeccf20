//! Scripted HX711 for tests and dry runs
//!
//! A [`ScriptedChip`] replays a queue of raw readings per channel. Like the
//! real chip, a conversion returns the input selected by the previous one and
//! power up selects channel A. Clones share state, so a test can keep one
//! clone to script and inspect the chip while the pipeline owns another.
//!
//! [`ScriptedFactory`] claims pins the way the GPIO driver does: a bus whose
//! pins belong to a live driver cannot be opened again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{Channel, ChipBus};
use crate::errors::ChipError;

use super::{ChipFactory, Hx711};

#[derive(Debug, Default)]
struct ChannelScript {
    readings: VecDeque<Result<i32, ChipError>>,
    repeat: Option<i32>,
}

#[derive(Debug, Default)]
struct ChipState {
    channel_a: ChannelScript,
    channel_b: ChannelScript,
    selected: Channel,
    reset_failure: Option<(ChipError, usize)>,
    resets: usize,
    reads: usize,
    power_cycles: usize,
}

impl ChipState {
    fn script(&mut self, channel: Channel) -> &mut ChannelScript {
        match channel {
            Channel::A => &mut self.channel_a,
            Channel::B => &mut self.channel_b,
        }
    }
}

/// Pins held by one opened driver, freed when the last clone is dropped
#[derive(Debug)]
struct PinClaim {
    bus: ChipBus,
    busy: Arc<Mutex<HashSet<u8>>>,
}

impl Drop for PinClaim {
    fn drop(&mut self) {
        let mut busy = lock_ignoring_poison(&self.busy);
        busy.remove(&self.bus.data);
        busy.remove(&self.bus.clock);
    }
}

/// HX711 stand-in driven by a script of readings
#[derive(Debug, Clone, Default)]
pub struct ScriptedChip {
    state: Arc<Mutex<ChipState>>,
    claim: Option<Arc<PinClaim>>,
}

impl ScriptedChip {
    /// Chip with empty scripts; every read fails with [`ChipError::NoData`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chip that answers every read on either channel with `raw`
    pub fn constant(raw: i32) -> Self {
        let chip = Self::new();
        chip.repeat_on(Channel::A, raw);
        chip.repeat_on(Channel::B, raw);
        chip
    }

    /// Queue `count` identical channel A readings
    pub fn push_batch(&self, raw: i32, count: usize) {
        self.push_batch_on(Channel::A, raw, count);
    }

    /// Queue `count` identical readings on `channel`
    pub fn push_batch_on(&self, channel: Channel, raw: i32, count: usize) {
        let mut state = self.lock();
        state
            .script(channel)
            .readings
            .extend(std::iter::repeat(Ok(raw)).take(count));
    }

    /// Queue a single channel A reading or fault
    pub fn push_reading(&self, reading: Result<i32, ChipError>) {
        self.lock().channel_a.readings.push_back(reading);
    }

    /// Channel A reading returned once its queue is exhausted
    pub fn repeat(&self, raw: i32) {
        self.repeat_on(Channel::A, raw);
    }

    /// Reading returned on `channel` once its queue is exhausted
    pub fn repeat_on(&self, channel: Channel, raw: i32) {
        self.lock().script(channel).repeat = Some(raw);
    }

    /// Fail the next `times` resets with `error`
    pub fn fail_resets(&self, error: ChipError, times: usize) {
        self.lock().reset_failure = Some((error, times));
    }

    /// Reset calls so far, failed ones included
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Conversions shifted out so far
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    /// Power downs so far
    pub fn power_cycles(&self) -> usize {
        self.lock().power_cycles
    }

    /// Input the next conversion will sample
    pub fn selected(&self) -> Channel {
        self.lock().selected
    }

    /// Readings still queued on both channels
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.channel_a.readings.len() + state.channel_b.readings.len()
    }

    fn lock(&self) -> MutexGuard<'_, ChipState> {
        lock_ignoring_poison(&self.state)
    }
}

impl Hx711 for ScriptedChip {
    fn reset(&mut self, next: Channel) -> Result<(), ChipError> {
        let mut state = self.lock();
        state.resets += 1;
        if let Some((error, remaining)) = state.reset_failure.take() {
            if remaining > 0 {
                if remaining > 1 {
                    state.reset_failure = Some((error.clone(), remaining - 1));
                }
                return Err(error);
            }
        }
        // The latching conversion of a reset is not scripted
        state.selected = next;
        Ok(())
    }

    fn read_raw(&mut self, next: Channel) -> Result<i32, ChipError> {
        let mut state = self.lock();
        state.reads += 1;
        let converted = state.selected;
        let script = state.script(converted);
        let reading = match script.readings.pop_front() {
            Some(reading) => reading,
            None => script.repeat.ok_or(ChipError::NoData),
        };
        if reading.is_ok() {
            state.selected = next;
        }
        reading
    }

    fn power_down(&mut self) -> Result<(), ChipError> {
        self.lock().power_cycles += 1;
        Ok(())
    }

    fn power_up(&mut self) -> Result<(), ChipError> {
        self.lock().selected = Channel::A;
        Ok(())
    }
}

/// Factory handing out [`ScriptedChip`]s by bus
///
/// Buses without a registered chip behave like an unconnected HX711 and fail
/// with a wiring error, unless a default reading was set with
/// [`ScriptedFactory::uniform`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    chips: HashMap<ChipBus, ScriptedChip>,
    default_reading: Option<i32>,
    busy: Arc<Mutex<HashSet<u8>>>,
    opens: usize,
}

impl ScriptedFactory {
    /// Factory without any connected chip
    pub fn new() -> Self {
        Self::default()
    }

    /// Every bus reads the constant `raw` on both channels
    pub fn uniform(raw: i32) -> Self {
        Self {
            default_reading: Some(raw),
            ..Self::default()
        }
    }

    /// Builder form of [`ScriptedFactory::insert`]
    pub fn with_chip(mut self, bus: impl Into<ChipBus>, chip: ScriptedChip) -> Self {
        self.insert(bus, chip);
        self
    }

    /// Connect `chip` to `bus`
    pub fn insert(&mut self, bus: impl Into<ChipBus>, chip: ScriptedChip) {
        self.chips.insert(bus.into(), chip);
    }

    /// Disconnect a chip
    pub fn remove(&mut self, bus: impl Into<ChipBus>) -> Option<ScriptedChip> {
        self.chips.remove(&bus.into())
    }

    /// Number of `open` calls so far
    pub fn opens(&self) -> usize {
        self.opens
    }

    /// True while an opened driver holds a pin of `bus`
    pub fn is_claimed(&self, bus: impl Into<ChipBus>) -> bool {
        let bus = bus.into();
        let busy = lock_ignoring_poison(&self.busy);
        busy.contains(&bus.data) || busy.contains(&bus.clock)
    }
}

impl ChipFactory for ScriptedFactory {
    type Chip = ScriptedChip;

    fn open(&mut self, bus: ChipBus) -> Result<ScriptedChip, ChipError> {
        self.opens += 1;
        if self.is_claimed(bus) {
            return Err(ChipError::Wiring(format!("pins of {} already in use", bus)));
        }

        let mut chip = match (self.chips.get(&bus), self.default_reading) {
            (Some(chip), _) => chip.clone(),
            (None, Some(raw)) => {
                let chip = ScriptedChip::constant(raw);
                self.chips.insert(bus, chip.clone());
                chip
            }
            (None, None) => return Err(ChipError::Wiring(format!("no HX711 answering on {}", bus))),
        };

        {
            let mut busy = lock_ignoring_poison(&self.busy);
            busy.insert(bus.data);
            busy.insert(bus.clock);
        }
        chip.claim = Some(Arc::new(PinClaim {
            bus,
            busy: Arc::clone(&self.busy),
        }));
        Ok(chip)
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
