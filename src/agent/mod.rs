//! Agent runs: approval-gated run lifecycle and autopilot scheduling.
//!
//! ## Overview
//!
//! A request ("Summarize this channel", "Deploy the hotfix") becomes a
//! **run**: a short plan of steps the engine walks through one tick at a
//! time, narrating each step into the run's thread and posting a
//! deliverable at the end. Risky or explicitly gated runs stop at an
//! approval gate until someone approves or denies them. **Autopilots** are
//! recurring instructions that start runs on a cadence.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (client/)│ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ RunEngine::start / decide / control    │
//!                       │         v                                        │
//!                       │  engine.rs  (progression chain, approval gate)   │
//!                       │         │            ^                           │
//!                       │         │            │ AutopilotDispatch         │
//!                       │         │     scheduler.rs  (cadence due check)  │
//!                       │         │ Planner::propose_run_plan()            │
//!                       │         v                                        │
//!                       │  planner.rs  (completion backends, fallback)     │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  registry.rs  (RunRegistry → EventSink → ws.rs)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Shared types: `Run`, `Autopilot`, `Cadence`, `Message`  |
//! | `lifecycle`   | Status transition table, `next_action`, progress math   |
//! | `classify`    | Pure text classifiers (risk, concise mode, to-do intent) |
//! | `approval`    | `ApprovalPolicy` trait and the built-in policies        |
//! | `deliverable` | Deliverable markdown body and artifact links            |
//! | `ws`          | `AgentEvent` push frames + `broadcast_message()` helper |

pub mod api;
pub mod approval;
pub mod classify;
pub mod deliverable;
pub mod engine;
pub mod lifecycle;
pub mod models;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::models::{Message, MessageKind, RunStatus};
    use super::ws::{AgentEvent, EventSink};

    /// Sink that keeps every published event for later assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<AgentEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<AgentEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Statuses a run went through, in publication order, without repeats.
        pub fn statuses(&self, run_id: &str) -> Vec<RunStatus> {
            let mut seen: Vec<RunStatus> = Vec::new();
            for event in self.events() {
                if let AgentEvent::RunUpserted { run } = event
                    && run.id == run_id
                    && seen.last() != Some(&run.status)
                {
                    seen.push(run.status);
                }
            }
            seen
        }

        pub fn progress(&self, run_id: &str) -> Vec<(RunStatus, u8)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    AgentEvent::RunUpserted { run } if run.id == run_id => {
                        Some((run.status, run.progress_pct))
                    }
                    _ => None,
                })
                .collect()
        }

        pub fn messages(&self, run_id: &str) -> Vec<Message> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    AgentEvent::NewMessage { message } if message.run_id.as_deref() == Some(run_id) => {
                        Some(message)
                    }
                    _ => None,
                })
                .collect()
        }

        pub fn narration(&self, run_id: &str) -> Vec<String> {
            self.messages(run_id)
                .into_iter()
                .filter(|m| m.kind == MessageKind::Message && m.text.starts_with("Step "))
                .map(|m| m.text)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: &AgentEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
