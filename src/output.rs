use crate::dispatcher::Dispatcher;
use crate::subscription::{Listeners, Subscription};
use crate::types::{InputId, Level, OutputDiagnostics, OutputId};
use crate::volume::{percentage_for_step, step_for_percentage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One amplified output channel
///
/// Caches what was last read from or written to the device and keeps the
/// input it was routed to across power-off, so `turn_on` can restore it.
/// Every operation is fail-soft: a device failure is logged and leaves the
/// cache untouched.
pub struct Output {
    number: OutputId,
    name: String,
    dispatcher: Dispatcher,
    input_names: BTreeMap<InputId, String>,
    state: Mutex<OutputState>,
    listeners: Listeners<()>,
}

/// Output state snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputState {
    /// 0.0..=1.0, `None` until read or set
    pub volume: Option<Level>,
    pub muted: bool,

    /// `None` when not routed
    pub assigned_input: Option<InputId>,

    /// Survives `turn_off`
    pub last_assigned_input: Option<InputId>,

    /// Logical power state, independent of routing
    pub ui_on: bool,
}

impl Output {
    /// Output with `Input N` labels for every input the dispatcher knows
    pub fn new(number: OutputId, name: impl Into<String>, dispatcher: Dispatcher) -> Arc<Self> {
        let input_names = (1..=dispatcher.input_count())
            .map(|input| (input, format!("Input {}", input)))
            .collect();
        Self::with_input_names(number, name, dispatcher, input_names)
    }

    pub fn with_input_names(
        number: OutputId,
        name: impl Into<String>,
        dispatcher: Dispatcher,
        input_names: BTreeMap<InputId, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            number,
            name: name.into(),
            dispatcher,
            input_names,
            state: Mutex::new(OutputState::default()),
            listeners: Listeners::new(),
        })
    }

    /// Get the 1-based channel number
    pub fn number(&self) -> OutputId {
        self.number
    }

    /// Get the display name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a consistent copy of the cached state
    pub fn state_snapshot(&self) -> OutputState {
        self.lock_state().clone()
    }

    pub fn volume(&self) -> Option<Level> {
        self.lock_state().volume
    }

    pub fn muted(&self) -> bool {
        self.lock_state().muted
    }

    /// Routed input, `None` if off
    pub fn source(&self) -> Option<InputId> {
        self.lock_state().assigned_input
    }

    pub fn has_source(&self) -> bool {
        self.lock_state().assigned_input.is_some()
    }

    pub fn is_on(&self) -> bool {
        self.lock_state().ui_on
    }

    /// Label of the routed input
    pub fn source_name(&self) -> Option<String> {
        let input = self.source()?;
        self.input_names.get(&input).cloned()
    }

    /// Input labels ordered by input number
    pub fn source_list(&self) -> Vec<String> {
        self.input_names.values().cloned().collect()
    }

    pub fn source_id_for_name(&self, name: &str) -> Option<InputId> {
        self.input_names
            .iter()
            .find(|(_, label)| label.as_str() == name)
            .map(|(input, _)| *input)
    }

    /// Route this output to `input` and mark it on
    pub async fn set_source(&self, input: InputId) {
        match self.dispatcher.set_output_to_input(self.number, input).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.assigned_input = Some(input);
                state.last_assigned_input = Some(input);
                state.ui_on = true;
            }
            Err(e) => tracing::error!("Failed to set source for output {}: {}", self.number, e),
        }
    }

    /// Set the volume, quantized to a device step.
    ///
    /// Step 0 reads back as Audio Off, so anything that rounds to it is sent
    /// as step 1.
    pub async fn set_volume(&self, level: Level) {
        let quantized = percentage_for_step(step_for_percentage(level));
        match self.dispatcher.set_output_volume(self.number, quantized).await {
            Ok(()) => self.lock_state().volume = Some(quantized),
            Err(e) => tracing::error!("Failed to set volume for output {}: {}", self.number, e),
        }
    }

    pub async fn set_muted(&self, muted: bool) {
        match self.dispatcher.set_output_mute(self.number, muted).await {
            Ok(()) => self.lock_state().muted = muted,
            Err(e) => tracing::error!("Failed to set mute for output {}: {}", self.number, e),
        }
    }

    /// Step the volume up; call [`Output::refresh`] to read the new level
    pub async fn volume_up_step(&self, large: bool) {
        if let Err(e) = self.dispatcher.volume_step_up(self.number, large).await {
            tracing::error!("Failed to step volume up for output {}: {}", self.number, e);
        }
    }

    /// Step the volume down; call [`Output::refresh`] to read the new level
    pub async fn volume_down_step(&self, large: bool) {
        if let Err(e) = self.dispatcher.volume_step_down(self.number, large).await {
            tracing::error!("Failed to step volume down for output {}: {}", self.number, e);
        }
    }

    /// Disconnect from any input, remembering the current one
    pub async fn turn_off(&self) {
        {
            let mut state = self.lock_state();
            if let Some(input) = state.assigned_input {
                state.last_assigned_input = Some(input);
            }
        }
        match self.dispatcher.disconnect_output(self.number).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.assigned_input = None;
                state.ui_on = false;
            }
            Err(e) => tracing::error!("Failed to turn off output {}: {}", self.number, e),
        }
    }

    /// Restore the remembered input, or just mark the output on
    pub async fn turn_on(&self) {
        let remembered = self.lock_state().last_assigned_input;
        match remembered {
            Some(input) => self.set_source(input).await,
            None => self.lock_state().ui_on = true,
        }
    }

    /// Re-read volume, mute and routing from the device.
    ///
    /// The cache is replaced only once all three reads succeed.
    pub async fn refresh(&self) {
        let volume = match self.dispatcher.get_output_volume(self.number).await {
            Ok(volume) => volume,
            Err(e) => {
                tracing::error!("Failed to refresh volume for output {}: {}", self.number, e);
                return;
            }
        };
        let muted = match self.dispatcher.get_output_mute(self.number).await {
            Ok(muted) => muted,
            Err(e) => {
                tracing::error!("Failed to refresh mute for output {}: {}", self.number, e);
                return;
            }
        };
        let source = match self.dispatcher.get_output_source(self.number).await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!("Failed to refresh source for output {}: {}", self.number, e);
                return;
            }
        };

        let input_count = self.dispatcher.input_count();
        let mut state = self.lock_state();
        state.volume = Some(volume);
        state.muted = muted;
        match source.filter(|input| (1..=input_count).contains(input)) {
            Some(input) => {
                state.assigned_input = Some(input);
                state.last_assigned_input = Some(input);
                state.ui_on = true;
            }
            None => {
                state.assigned_input = None;
                state.ui_on = false;
            }
        }
        tracing::debug!("Refreshed output {}: {:?}", self.number, *state);
    }

    /// [`Output::refresh`], then notify every listener
    pub async fn refresh_and_notify(&self) {
        self.refresh().await;
        self.listeners.notify((), &format!("output {}", self.number));
    }

    /// Observe completed refreshes
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.listeners.add(move |()| listener())
    }

    pub(crate) fn diagnostics(&self) -> OutputDiagnostics {
        let state = self.state_snapshot();
        OutputDiagnostics {
            number: self.number,
            name: self.name.clone(),
            volume: state.volume,
            muted: state.muted,
            source: state.assigned_input,
            has_source: state.assigned_input.is_some(),
        }
    }
}
