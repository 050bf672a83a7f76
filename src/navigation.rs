//! Route changes requested by the client layer.

use crate::journal::Journal;
use crate::redirect::{RedirectLoopBreaker, Verdict};
use std::sync::Arc;

/// Where the client layer sends the user
pub trait Navigator: Send + Sync {
    /// Move to an in-app route such as `/login`
    fn navigate(&self, route: &str);

    /// Leave the app for an external URL (payment checkout)
    fn open_external(&self, url: &str);
}

/// Navigator for the terminal: routes are announced, nothing is opened
#[derive(Debug, Default)]
pub struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, route: &str) {
        tracing::info!(route, "navigate");
        println!("-> {}", route);
    }

    fn open_external(&self, url: &str) {
        tracing::info!(url, "open external");
        println!("Open this URL to continue: {}", url);
    }
}

/// Login redirects that go through the loop breaker first
pub struct RedirectGuard {
    breaker: Arc<RedirectLoopBreaker>,
    navigator: Arc<dyn Navigator>,
    journal: Arc<Journal>,
    login_route: String,
}

impl RedirectGuard {
    pub fn new(
        breaker: Arc<RedirectLoopBreaker>,
        navigator: Arc<dyn Navigator>,
        journal: Arc<Journal>,
        login_route: &str,
    ) -> Self {
        Self {
            breaker,
            navigator,
            journal,
            login_route: login_route.to_string(),
        }
    }

    pub fn breaker(&self) -> &RedirectLoopBreaker {
        &self.breaker
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }

    /// Send the user to the login route unless `source` is looping
    pub fn redirect_to_login(&self, source: &str) -> Verdict {
        let verdict = self.breaker.record(source);
        let broken = verdict == Verdict::Break;
        let _ = self.journal.redirect(source, &self.login_route, broken);
        if !broken {
            self.navigator.navigate(&self.login_route);
        }
        verdict
    }
}
