#![forbid(unsafe_code)]

// Active-speaker policy - ranking of audio producers by recency of
// dominance, and the pause/resume plan a room derives from it

use crate::engine::types::{ProducerId, SessionId};

/// How many speakers are relayed at once. Everyone past this rank has
/// their media paused server-side.
pub const MAX_ACTIVE_SPEAKERS: usize = 5;

/// Audio producer ids ordered by how recently their owner was dominant.
/// The first [`MAX_ACTIVE_SPEAKERS`] entries form the active window.
#[derive(Debug, Clone, Default)]
pub struct SpeakerRanking {
    order: Vec<ProducerId>,
}

impl SpeakerRanking {
    /// Moves `pid` to the front, preserving the relative order of all
    /// other entries. A pid not yet ranked is inserted at the front.
    pub fn promote(&mut self, pid: ProducerId) {
        self.order.retain(|p| *p != pid);
        self.order.insert(0, pid);
    }

    /// Ranks a new producer at the back, where it starts paused unless
    /// the window has room. No-op if already ranked.
    pub fn push_tail(&mut self, pid: ProducerId) {
        if !self.order.contains(&pid) {
            self.order.push(pid);
        }
    }

    pub fn remove(&mut self, pid: ProducerId) {
        self.order.retain(|p| *p != pid);
    }

    pub fn contains(&self, pid: ProducerId) -> bool {
        self.order.contains(&pid)
    }

    /// Speakers currently relayed, most recently dominant first.
    pub fn window(&self) -> &[ProducerId] {
        &self.order[..self.order.len().min(MAX_ACTIVE_SPEAKERS)]
    }

    /// Ranked speakers outside the window.
    pub fn muted_tail(&self) -> &[ProducerId] {
        &self.order[self.order.len().min(MAX_ACTIVE_SPEAKERS)..]
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What the policy needs to know about one client.
#[derive(Debug, Clone)]
pub struct ClientView {
    pub session: SessionId,
    /// The client's own audio producer, if it is producing.
    pub audio_pid: Option<ProducerId>,
    /// Remote audio pids the client holds downstreams for.
    pub subscribed: Vec<ProducerId>,
}

/// One pause or resume the room must apply to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerAction {
    /// Pause the client's own producer pair; it left the window.
    PauseOwn(SessionId),
    /// Resume the client's own producer pair; it is in the window.
    ResumeOwn(SessionId),
    /// Pause the consumer pair a client holds for a remote audio pid.
    PauseSubscription(SessionId, ProducerId),
    /// Resume the consumer pair a client holds for a remote audio pid.
    ResumeSubscription(SessionId, ProducerId),
}

/// Outcome of one policy pass.
#[derive(Debug, Default)]
pub struct PolicyDecision {
    /// The active window, most recently dominant first.
    pub active: Vec<ProducerId>,
    /// Engine work to apply, every pause ahead of every resume.
    pub actions: Vec<SpeakerAction>,
    /// Window speakers a client has no subscription for yet and must be
    /// told to start consuming.
    pub new_subscriptions: Vec<(SessionId, Vec<ProducerId>)>,
}

/// Computes the pause/resume plan for the current ranking. Pauses are
/// emitted before resumes so a window swap never relays more than
/// [`MAX_ACTIVE_SPEAKERS`] speakers at any instant.
pub fn evaluate(ranking: &SpeakerRanking, clients: &[ClientView]) -> PolicyDecision {
    let mut decision = PolicyDecision {
        active: ranking.window().to_vec(),
        ..PolicyDecision::default()
    };
    let muted = ranking.muted_tail();

    for client in clients {
        for &pid in muted {
            if client.audio_pid == Some(pid) {
                decision.actions.push(SpeakerAction::PauseOwn(client.session));
            } else if client.subscribed.contains(&pid) {
                decision
                    .actions
                    .push(SpeakerAction::PauseSubscription(client.session, pid));
            }
        }
    }

    for client in clients {
        let mut fresh = Vec::new();
        for &pid in &decision.active {
            if client.audio_pid == Some(pid) {
                decision.actions.push(SpeakerAction::ResumeOwn(client.session));
            } else if client.subscribed.contains(&pid) {
                decision
                    .actions
                    .push(SpeakerAction::ResumeSubscription(client.session, pid));
            } else {
                fresh.push(pid);
            }
        }
        if !fresh.is_empty() {
            decision.new_subscriptions.push((client.session, fresh));
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pids(n: usize) -> Vec<ProducerId> {
        (0..n).map(|_| ProducerId::new()).collect()
    }

    fn ranking_of(order: &[ProducerId]) -> SpeakerRanking {
        let mut ranking = SpeakerRanking::default();
        for &pid in order {
            ranking.push_tail(pid);
        }
        ranking
    }

    #[test]
    fn promote_moves_to_front_and_keeps_relative_order() {
        let p = pids(6);
        let mut ranking = ranking_of(&p);

        ranking.promote(p[3]);

        let expected = vec![p[3], p[0], p[1], p[2], p[4], p[5]];
        let got: Vec<_> = ranking
            .window()
            .iter()
            .chain(ranking.muted_tail())
            .copied()
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn promote_inserts_unranked_pid_at_front() {
        let p = pids(3);
        let mut ranking = ranking_of(&p[..2]);

        ranking.promote(p[2]);

        assert_eq!(ranking.window(), &[p[2], p[0], p[1]]);
        assert_eq!(ranking.len(), 3);
    }

    #[test]
    fn push_tail_does_not_duplicate() {
        let p = pids(2);
        let mut ranking = ranking_of(&p);

        ranking.push_tail(p[0]);

        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking.window(), &[p[0], p[1]]);
    }

    #[test]
    fn window_caps_at_five_speakers() {
        let p = pids(7);
        let ranking = ranking_of(&p);

        assert_eq!(ranking.window(), &p[..5]);
        assert_eq!(ranking.muted_tail(), &p[5..]);
    }

    #[test]
    fn evaluate_emits_every_pause_before_any_resume() {
        let p = pids(6);
        let ranking = ranking_of(&p);
        // Each client owns one pid and subscribes to all the others.
        let clients: Vec<ClientView> = p
            .iter()
            .map(|&own| ClientView {
                session: SessionId::new(),
                audio_pid: Some(own),
                subscribed: p.iter().copied().filter(|&o| o != own).collect(),
            })
            .collect();

        let decision = evaluate(&ranking, &clients);

        let is_pause = |a: &SpeakerAction| {
            matches!(
                a,
                SpeakerAction::PauseOwn(_) | SpeakerAction::PauseSubscription(_, _)
            )
        };
        let last_pause = decision.actions.iter().rposition(is_pause);
        let first_resume = decision.actions.iter().position(|a| !is_pause(a));
        if let (Some(pause), Some(resume)) = (last_pause, first_resume) {
            assert!(pause < resume, "Pause found after a resume");
        }

        // The sixth speaker is pause-targeted by its owner and its five
        // subscribers; everyone in the window gets resumed.
        let pauses = decision.actions.iter().filter(|a| is_pause(a)).count();
        assert_eq!(pauses, 6);
        assert!(decision.new_subscriptions.is_empty());
    }

    #[test]
    fn evaluate_pairs_owner_and_subscriber_actions() {
        let p = pids(6);
        let ranking = ranking_of(&p);
        let muted_pid = p[5];

        let owner = ClientView {
            session: SessionId::new(),
            audio_pid: Some(muted_pid),
            subscribed: vec![],
        };
        let subscriber = ClientView {
            session: SessionId::new(),
            audio_pid: None,
            subscribed: vec![muted_pid],
        };

        let decision = evaluate(&ranking, &[owner.clone(), subscriber.clone()]);

        assert!(decision
            .actions
            .contains(&SpeakerAction::PauseOwn(owner.session)));
        assert!(decision
            .actions
            .contains(&SpeakerAction::PauseSubscription(subscriber.session, muted_pid)));
    }

    #[test]
    fn evaluate_reports_missing_subscriptions() {
        let p = pids(3);
        let ranking = ranking_of(&p);

        let newcomer = ClientView {
            session: SessionId::new(),
            audio_pid: Some(p[0]),
            subscribed: vec![p[1]],
        };

        let decision = evaluate(&ranking, &[newcomer.clone()]);

        assert_eq!(decision.new_subscriptions.len(), 1);
        let (session, fresh) = &decision.new_subscriptions[0];
        assert_eq!(*session, newcomer.session);
        assert_eq!(fresh.as_slice(), &[p[2]]);
    }

    #[test]
    fn remove_drops_pid_and_shrinks_window() {
        let p = pids(6);
        let mut ranking = ranking_of(&p);

        ranking.remove(p[1]);

        assert!(!ranking.contains(p[1]));
        assert_eq!(ranking.window(), &[p[0], p[2], p[3], p[4], p[5]]);
        assert!(ranking.muted_tail().is_empty());
    }
}
