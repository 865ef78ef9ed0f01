use async_trait::async_trait;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use tracing::debug;

use crate::{RenderBackend, RenderConfig, RenderError};

/// Launches a fresh headless Chromium per render and returns the settled DOM.
#[derive(Debug, Clone)]
pub struct ChromiumRenderer {
    config: RenderConfig,
    user_agents: Vec<String>,
}

impl ChromiumRenderer {
    pub fn new(config: RenderConfig, user_agents: Vec<String>) -> Self {
        Self {
            config,
            user_agents,
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, RenderError> {
        let user_agent = {
            let mut rng = rand::rng();
            self.user_agents.choose(&mut rng).cloned()
        };

        let mut builder = BrowserConfig::builder()
            .window_size(self.config.window_width, self.config.window_height)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled");
        if self.config.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(ua) = user_agent {
            builder = builder.arg(format!("--user-agent={ua}"));
        }
        builder.build().map_err(RenderError::Unavailable)
    }
}

#[async_trait]
impl RenderBackend for ChromiumRenderer {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn render(&self, url: &str) -> Result<String, RenderError> {
        let config = self.browser_config()?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let rendered: Result<String, CdpError> = async {
            let page = browser.new_page(url).await?;
            page.wait_for_navigation().await?;
            self.config.settle.sleep().await;
            page.content().await
        }
        .await;

        if let Err(err) = browser.close().await {
            debug!(error = %err, "closing headless browser failed");
        }
        handler_task.abort();

        rendered.map_err(|e| RenderError::Failed(e.to_string()))
    }
}
