//! HTTP control surface.
//!
//! An [`axum`] router that lets a browser or script start, list and stop
//! sessions, and fetch what a viewer needs to play one. Session starts and
//! stops run on the blocking pool since they wait on encoder processes.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/` | Launcher page |
//! | GET | `/api/channels` | Channel names from the registry |
//! | POST | `/api/start` | Start a session (JSON body) |
//! | GET | `/api/sessions` | List sessions |
//! | GET | `/api/sessions/<id>` | One session |
//! | POST | `/api/stop/<id>` | Stop a session |
//! | DELETE | `/api/sessions/<id>` | Stop a session |
//! | GET | `/sdp/<id>` | Published SDP of a running RTP session |
//! | GET | `/hls/<id>/<file>` | Playlist or segment of a running HLS session |
//!
//! Errors are JSON `{"error": "..."}` bodies: 400 for bad input, 404 for an
//! unknown channel or session, 409 when the target already has a session,
//! 502 when the encoder or player could not be started. Bodies over
//! [`MAX_BODY_BYTES`] get 413 and unknown paths a JSON 404.

pub mod handler;

pub use handler::{ControlState, MAX_BODY_BYTES, router};
