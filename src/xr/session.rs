// OpenXR session, reference space and event handling

use anyhow::{Context, Result};
use openxr as xr;

use super::XrContext;
use crate::backend::GraphicsApi;

/// What the application should do after a session state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionAction {
    Begin,
    End,
    Exit,
    None,
}

pub fn session_action(state: xr::SessionState) -> SessionAction {
    match state {
        xr::SessionState::READY => SessionAction::Begin,
        xr::SessionState::STOPPING => SessionAction::End,
        xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => SessionAction::Exit,
        _ => SessionAction::None,
    }
}

/// Frames are rendered only while the runtime shows the application
pub fn is_state_active(state: xr::SessionState) -> bool {
    matches!(
        state,
        xr::SessionState::SYNCHRONIZED | xr::SessionState::VISIBLE | xr::SessionState::FOCUSED
    )
}

pub struct XrSession<G: xr::Graphics> {
    // Spaces go before the session
    pub space: xr::Space,
    pub frame_stream: xr::FrameStream<G>,
    pub frame_waiter: xr::FrameWaiter,
    pub session: xr::Session<G>,
    pub state: xr::SessionState,
    pub running: bool,
    event_storage: xr::EventDataBuffer,
}

impl<G: xr::Graphics> XrSession<G> {
    pub fn new<B>(xr_ctx: &XrContext, api: &B) -> Result<Self>
    where
        B: GraphicsApi<Xr = G>,
    {
        let (session, frame_waiter, frame_stream) = unsafe {
            xr_ctx
                .instance
                .create_session::<G>(xr_ctx.system, &api.graphics_binding())
        }
        .with_context(|| format!("Failed to create OpenXR session for {}", api.api_type()))?;

        let space = session
            .create_reference_space(xr::ReferenceSpaceType::LOCAL, xr::Posef::IDENTITY)
            .context("Failed to create LOCAL reference space")?;

        log::info!("OpenXR session created with {}", api.api_type());

        Ok(Self {
            space,
            frame_stream,
            frame_waiter,
            session,
            state: xr::SessionState::UNKNOWN,
            running: false,
            event_storage: xr::EventDataBuffer::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.running && is_state_active(self.state)
    }

    /// Drain the event queue. Returns false once the application should quit.
    pub fn poll_events(
        &mut self,
        instance: &xr::Instance,
        view_configuration: xr::ViewConfigurationType,
    ) -> Result<bool> {
        while let Some(event) = instance
            .poll_event(&mut self.event_storage)
            .context("Failed to poll OpenXR events")?
        {
            use xr::Event::*;
            match event {
                SessionStateChanged(e) => {
                    log::info!("Session state {:?} -> {:?}", self.state, e.state());
                    self.state = e.state();
                    match session_action(e.state()) {
                        SessionAction::Begin => {
                            self.session
                                .begin(view_configuration)
                                .context("Failed to begin session")?;
                            self.running = true;
                        }
                        SessionAction::End => {
                            self.session.end().context("Failed to end session")?;
                            self.running = false;
                        }
                        SessionAction::Exit => {
                            self.running = false;
                            return Ok(false);
                        }
                        SessionAction::None => {}
                    }
                }
                InstanceLossPending(_) => {
                    log::warn!("OpenXR instance loss pending");
                    self.running = false;
                    return Ok(false);
                }
                EventsLost(e) => log::warn!("Lost {} OpenXR events", e.lost_event_count()),
                InteractionProfileChanged(_) => log::info!("Interaction profile changed"),
                ReferenceSpaceChangePending(e) => {
                    log::info!("Reference space {:?} change pending", e.reference_space_type())
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Ask the runtime to end the session; it answers with STOPPING then EXITING
    pub fn request_exit(&self) -> Result<()> {
        match self.session.request_exit() {
            Ok(()) | Err(xr::sys::Result::ERROR_SESSION_NOT_RUNNING) => Ok(()),
            Err(e) => Err(e).context("Failed to request session exit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states_map_to_actions() {
        assert_eq!(session_action(xr::SessionState::READY), SessionAction::Begin);
        assert_eq!(session_action(xr::SessionState::STOPPING), SessionAction::End);
        assert_eq!(session_action(xr::SessionState::EXITING), SessionAction::Exit);
        assert_eq!(session_action(xr::SessionState::LOSS_PENDING), SessionAction::Exit);
        assert_eq!(session_action(xr::SessionState::FOCUSED), SessionAction::None);
    }

    #[test]
    fn only_shown_states_render() {
        assert!(is_state_active(xr::SessionState::SYNCHRONIZED));
        assert!(is_state_active(xr::SessionState::VISIBLE));
        assert!(is_state_active(xr::SessionState::FOCUSED));
        assert!(!is_state_active(xr::SessionState::READY));
        assert!(!is_state_active(xr::SessionState::IDLE));
    }
}
