//! The signed-in rider's profile, search history and authored routes.

use std::sync::Arc;

use tracing::{debug, warn};
use trotro_transit::{CreatedRoute, SearchHistoryEntry, Session, UserProfile, UserStore};

use crate::rate::{OperationClass, RateGovernor, Subject};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileSnapshot {
    pub profile: Option<UserProfile>,
    pub search_history: Vec<SearchHistoryEntry>,
    pub created_routes: Vec<CreatedRoute>,
}

pub struct ProfileService {
    users: Arc<dyn UserStore>,
    governor: Arc<RateGovernor>,
}

impl ProfileService {
    pub fn new(users: Arc<dyn UserStore>, governor: Arc<RateGovernor>) -> Self {
        Self { users, governor }
    }

    /// Load everything shown on the profile screen.
    ///
    /// Each part is fetched under the profile-info allowance and degrades to
    /// empty on failure or denial. Returns `None` without a session.
    pub async fn load(&self, session: Option<&Session>) -> Option<ProfileSnapshot> {
        let session = session?;
        let subject = Subject::from_session(Some(session));
        let user_id = &session.user_id;

        let profile = async {
            if !self.admit(&subject, "profile") {
                return None;
            }
            self.users
                .fetch_profile(user_id)
                .await
                .map_err(|e| warn!(error = %e, user = %user_id, "failed to load profile"))
                .ok()
                .flatten()
        };

        let history = async {
            if !self.admit(&subject, "search history") {
                return Vec::new();
            }
            self.users
                .fetch_search_history(user_id)
                .await
                .map_err(|e| warn!(error = %e, user = %user_id, "failed to load search history"))
                .unwrap_or_default()
        };

        let created = async {
            if !self.admit(&subject, "created routes") {
                return Vec::new();
            }
            self.users
                .fetch_created_routes(user_id)
                .await
                .map_err(|e| warn!(error = %e, user = %user_id, "failed to load created routes"))
                .unwrap_or_default()
        };

        let (profile, search_history, created_routes) = tokio::join!(profile, history, created);

        Some(ProfileSnapshot {
            profile,
            search_history,
            created_routes,
        })
    }

    fn admit(&self, subject: &Subject, what: &str) -> bool {
        let decision = self.governor.check(subject, OperationClass::ProfileInfo);
        if !decision.allowed {
            debug!(%subject, what, "profile lookup rate limited");
        }
        decision.allowed
    }
}
