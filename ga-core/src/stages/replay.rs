//! Replay of client input events on the server.
//!
//! Events arrive from the control channel with pointer coordinates
//! relative to the captured area. When a crop rectangle is configured
//! they are translated to screen space and clipped to the rectangle, so
//! a client can never move the pointer outside what it can see.
//!
//! Actual OS injection is behind [`InputSink`]; the default
//! [`TracingSink`] only logs.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GaError;
use crate::message::InputEvent;
use crate::pipeline::{
    CropRect, Stage, StageContext, StageKind, StageTask, not_initialized, spawn_stage,
};

/// Events buffered between the control server and the replay task.
pub const INPUT_QUEUE: usize = 64;

// ── InputSink ────────────────────────────────────────────────────

/// Destination for replayed input.
pub trait InputSink: Send {
    fn replay(&mut self, event: InputEvent) -> Result<(), GaError>;
}

/// Sink that logs every event at `debug`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl InputSink for TracingSink {
    fn replay(&mut self, event: InputEvent) -> Result<(), GaError> {
        debug!(?event, "input replayed");
        Ok(())
    }
}

/// Map an event from capture-relative to screen coordinates.
pub fn to_screen(event: InputEvent, crop: Option<&CropRect>) -> InputEvent {
    let Some(rect) = crop else {
        return event;
    };
    let place = |x: i32, y: i32| {
        rect.clip(
            x.saturating_add(rect.left as i32),
            y.saturating_add(rect.top as i32),
        )
    };
    match event {
        InputEvent::MouseMove { x, y } => {
            let (x, y) = place(x, y);
            InputEvent::MouseMove { x, y }
        }
        InputEvent::MouseButton {
            button,
            pressed,
            x,
            y,
        } => {
            let (x, y) = place(x, y);
            InputEvent::MouseButton {
                button,
                pressed,
                x,
                y,
            }
        }
        other => other,
    }
}

// ── ControlReplay stage ──────────────────────────────────────────

/// Stage that feeds control-channel input into an [`InputSink`].
pub struct ControlReplay {
    tx: mpsc::Sender<InputEvent>,
    rx: Option<mpsc::Receiver<InputEvent>>,
    sink: Option<Box<dyn InputSink>>,
    crop: Option<CropRect>,
    shutdown: Option<CancellationToken>,
}

impl ControlReplay {
    pub fn new() -> Self {
        Self::with_sink(Box::new(TracingSink))
    }

    pub fn with_sink(sink: Box<dyn InputSink>) -> Self {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        Self {
            tx,
            rx: Some(rx),
            sink: Some(sink),
            crop: None,
            shutdown: None,
        }
    }
}

impl Default for ControlReplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for ControlReplay {
    fn kind(&self) -> StageKind {
        StageKind::ControlReplay
    }

    fn initialize(&mut self, ctx: &mut StageContext<'_>) -> Result<(), GaError> {
        if let Some(crop) = ctx.settings.crop {
            crop.validate()?;
            info!(%crop, "input replay clipped to capture area");
        }
        self.crop = ctx.settings.crop;
        self.shutdown = Some(ctx.shutdown.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<StageTask, GaError> {
        let kind = self.kind();
        let (Some(mut rx), Some(mut sink), Some(shutdown)) =
            (self.rx.take(), self.sink.take(), self.shutdown.take())
        else {
            return Err(not_initialized(kind));
        };
        let crop = self.crop;

        spawn_stage(kind, async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                if let Err(e) = sink.replay(to_screen(event, crop.as_ref())) {
                    warn!("input replay failed: {e}");
                }
            }
            debug!("control replay stopped");
        })
    }

    fn input_sender(&self) -> Option<mpsc::Sender<InputEvent>> {
        Some(self.tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipeRegistry, PipelineSettings};
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<InputEvent>>>);

    impl InputSink for Collect {
        fn replay(&mut self, event: InputEvent) -> Result<(), GaError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    const CROP: CropRect = CropRect {
        left: 100,
        top: 50,
        right: 420,
        bottom: 290,
    };

    #[test]
    fn no_crop_passes_through() {
        let ev = InputEvent::MouseMove { x: -5, y: 9000 };
        assert_eq!(to_screen(ev, None), ev);
    }

    #[test]
    fn pointer_is_offset_and_clipped() {
        assert_eq!(
            to_screen(InputEvent::MouseMove { x: 10, y: 20 }, Some(&CROP)),
            InputEvent::MouseMove { x: 110, y: 70 }
        );
        assert_eq!(
            to_screen(InputEvent::MouseMove { x: 5000, y: -300 }, Some(&CROP)),
            InputEvent::MouseMove { x: 419, y: 50 }
        );
        let click = InputEvent::MouseButton {
            button: 1,
            pressed: true,
            x: 320,
            y: 240,
        };
        assert_eq!(
            to_screen(click, Some(&CROP)),
            InputEvent::MouseButton {
                button: 1,
                pressed: true,
                x: 419,
                y: 289,
            }
        );
    }

    #[test]
    fn keys_are_untouched() {
        let key = InputEvent::Key {
            scancode: 30,
            pressed: true,
        };
        assert_eq!(to_screen(key, Some(&CROP)), key);
    }

    #[tokio::test]
    async fn events_reach_the_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut stage = ControlReplay::with_sink(Box::new(Collect(Arc::clone(&seen))));
        let settings = PipelineSettings {
            crop: Some(CROP),
            ..Default::default()
        };
        let shutdown = CancellationToken::new();
        stage
            .initialize(&mut StageContext {
                settings: &settings,
                pipes: &mut PipeRegistry::new(),
                shutdown: shutdown.clone(),
            })
            .unwrap();
        let tx = stage.input_sender().unwrap();
        let task = stage.start().unwrap();

        tx.send(InputEvent::MouseMove { x: 1, y: 1 }).await.unwrap();
        drop(tx);
        drop(stage);
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![InputEvent::MouseMove { x: 101, y: 51 }]
        );
    }
}
