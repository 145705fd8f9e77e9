//! Control surface: query RPCs answered directly on the issuing session.
//!
//! Responses carry the request envelope's id and bypass the delivery
//! queues. SPAWN and RELEASE delegate to the injected launcher.

use crate::broker::{Waiter, WaiterKind};
use crate::launcher::SpawnSpec;
use crate::router::Router;
use relay_proto::envelope::{
    self, AgentList, Body, Envelope, HealthReport, InboxQuery, InboxSnapshot, OpResult,
    ReleaseResult, SpawnResult, StatusReport,
};
use std::time::Instant;
use tracing::info;

impl Router {
    pub(crate) fn handle_control(&mut self, conn_id: u64, env: Envelope) {
        let request_id = env.id.clone();
        let response = match env.body {
            Body::Status => Some(Body::StatusResponse(self.status_report())),
            Body::ListAgents => Some(Body::ListAgentsResponse(AgentList {
                agents: self.registry.agent_snapshots(false),
            })),
            Body::ListConnectedAgents => Some(Body::ListConnectedAgentsResponse(AgentList {
                agents: self.registry.agent_snapshots(true),
            })),
            Body::Inbox(query) => Some(Body::InboxResponse(self.inbox_snapshot(conn_id, query))),
            Body::Health => Some(Body::HealthResponse(HealthReport {
                ok: true,
                uptime_ms: self.uptime_ms(),
            })),
            Body::Metrics => Some(Body::MetricsResponse(self.metrics.clone())),
            Body::RemoveAgent(req) => Some(Body::RemoveAgentResponse(self.remove_agent(&req.name))),
            Body::Spawn(req) => self.spawn(conn_id, &request_id, req),
            Body::Release(req) => Some(Body::ReleaseResult(self.release(&req.name))),
            _ => None,
        };

        if let Some(body) = response {
            let mut reply = Envelope::new(body);
            reply.id = request_id;
            self.write_conn(conn_id, reply);
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn status_report(&self) -> StatusReport {
        let queued_total = self
            .registry
            .session_ids()
            .iter()
            .filter_map(|sid| self.registry.session(sid))
            .map(|s| s.queue.len())
            .sum();
        StatusReport {
            uptime_ms: self.uptime_ms(),
            session_count: self.registry.session_count(),
            agent_count: self.registry.agent_count(),
            channel_count: self.registry.channel_count(),
            queued_total,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn inbox_snapshot(&self, conn_id: u64, query: InboxQuery) -> InboxSnapshot {
        let requester = self
            .registry
            .session_by_conn(conn_id)
            .map(|s| s.agent.clone())
            .unwrap_or_default();
        let agent = query.agent.unwrap_or(requester);
        let limit = query.limit.unwrap_or(self.config.inbox_max);
        let messages = self.registry.inbox_snapshot(&agent, limit);
        let total = self
            .registry
            .agent(&agent)
            .map(|r| r.inbox.len())
            .unwrap_or(0);
        InboxSnapshot {
            agent,
            total,
            messages,
        }
    }

    fn remove_agent(&mut self, name: &str) -> OpResult {
        if let Some(sid) = self.registry.session_id_by_name(name) {
            self.broker.fail_session(&sid);
            self.registry.remove_session(&sid);
        }
        let removed = self.registry.remove_agent(name).is_some();
        self.persist_channels();
        if removed {
            info!(agent = %name, "agent removed");
            OpResult {
                ok: true,
                error: None,
            }
        } else {
            OpResult {
                ok: false,
                error: Some(format!("unknown agent {}", name)),
            }
        }
    }

    /// Returns None when the reply is deferred until AGENT_READY.
    fn spawn(
        &mut self,
        conn_id: u64,
        request_id: &str,
        req: envelope::SpawnRequest,
    ) -> Option<Body> {
        let spec = SpawnSpec {
            name: req.name.clone(),
            cli: req.cli.clone(),
            task: req.task.clone(),
            cwd: req.cwd.clone(),
            team: req.team.clone(),
            shadow_of: req.shadow_of.clone(),
        };
        match self.launcher.spawn(spec) {
            Ok(spawned) => {
                if req.await_ready {
                    let Some(owner) = self.registry.session_id_by_conn(conn_id) else {
                        return Some(Body::SpawnResult(SpawnResult {
                            ok: true,
                            name: spawned.name,
                            pid: spawned.pid,
                            ready: None,
                            error: None,
                        }));
                    };
                    let data = serde_json::json!({
                        "request_id": request_id,
                        "pid": spawned.pid,
                    });
                    self.broker.register(Waiter {
                        kind: WaiterKind::SpawnReady,
                        correlation_id: req.name.clone(),
                        owner_session: owner,
                        deadline: Instant::now() + self.config.spawn_ready_timeout(),
                        data: Some(data.to_string()),
                    });
                    None
                } else {
                    Some(Body::SpawnResult(SpawnResult {
                        ok: true,
                        name: spawned.name,
                        pid: spawned.pid,
                        ready: None,
                        error: None,
                    }))
                }
            }
            Err(e) => Some(Body::SpawnResult(SpawnResult {
                ok: false,
                name: req.name,
                pid: None,
                ready: None,
                error: Some(e.to_string()),
            })),
        }
    }

    fn release(&mut self, name: &str) -> ReleaseResult {
        match self.launcher.release(name) {
            Ok(()) => ReleaseResult {
                ok: true,
                name: name.to_string(),
                error: None,
            },
            Err(e) => ReleaseResult {
                ok: false,
                name: name.to_string(),
                error: Some(e.to_string()),
            },
        }
    }
}
