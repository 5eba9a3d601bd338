//! Deterministic in-memory driver.
//!
//! Pages are declared as selector tables, loadable from JSON fixture files
//! captured off a live portal. The scripted browser replays them with optional
//! fault injection: bounded navigation failures, stale-element budgets per
//! selector, redirected landings, failing script evaluation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Browser, DriverError, DriverResult, Element, Page};

fn default_true() -> bool {
    true
}

/// A full scripted site: URL -> page script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub pages: HashMap<String, PageScript>,
}

impl Script {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn with_page(mut self, url: impl Into<String>, page: PageScript) -> Self {
        self.pages.insert(url.into(), page);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageScript {
    /// selector -> matched elements, in document order.
    #[serde(default)]
    pub elements: HashMap<String, Vec<ElementScript>>,
    /// selector -> text, for `Page::inner_text` lookups.
    #[serde(default)]
    pub texts: HashMap<String, String>,
    /// First N navigations to this URL fail before succeeding.
    #[serde(default)]
    pub fail_navigations: u32,
    /// selector -> number of queries that report a stale element first.
    #[serde(default)]
    pub stale_queries: HashMap<String, u32>,
    /// URL the browser reports after landing here (server-side redirect).
    #[serde(default)]
    pub landed_url: Option<String>,
    /// Every `evaluate` on this page fails.
    #[serde(default)]
    pub fail_scripts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementScript {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// selector -> child elements.
    #[serde(default)]
    pub children: HashMap<String, Vec<ElementScript>>,
}

impl Default for ElementScript {
    fn default() -> Self {
        Self {
            text: String::new(),
            attributes: HashMap::new(),
            visible: true,
            enabled: true,
            children: HashMap::new(),
        }
    }
}

impl ElementScript {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn child(mut self, selector: impl Into<String>, element: ElementScript) -> Self {
        self.children.entry(selector.into()).or_default().push(element);
        self
    }

    pub fn children(mut self, selector: impl Into<String>, elements: Vec<ElementScript>) -> Self {
        self.children.entry(selector.into()).or_default().extend(elements);
        self
    }

    fn label(&self) -> String {
        self.attributes
            .get("id")
            .cloned()
            .unwrap_or_else(|| self.text.clone())
    }
}

/// Mutable replay state shared by every page of one scripted browser.
#[derive(Debug, Default)]
struct RunState {
    nav_failures_left: HashMap<String, u32>,
    stale_left: HashMap<(String, String), u32>,
    pub evaluated: Vec<String>,
    pub clicked: Vec<String>,
    pub navigations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptedBrowser {
    script: Arc<Script>,
    state: Arc<Mutex<RunState>>,
}

impl ScriptedBrowser {
    pub fn new(script: Script) -> Self {
        let mut state = RunState::default();
        for (url, page) in &script.pages {
            if page.fail_navigations > 0 {
                state.nav_failures_left.insert(url.clone(), page.fail_navigations);
            }
            for (selector, count) in &page.stale_queries {
                state
                    .stale_left
                    .insert((url.clone(), selector.clone()), *count);
            }
        }
        Self {
            script: Arc::new(script),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Scripts the engine evaluated, in order. Test hook.
    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.state.lock().expect("state lock").evaluated.clone()
    }

    /// Elements the engine clicked (by id attribute or text). Test hook.
    pub fn clicked_elements(&self) -> Vec<String> {
        self.state.lock().expect("state lock").clicked.clone()
    }

    /// Every successful navigation target, in order. Test hook.
    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().expect("state lock").navigations.clone()
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn new_page(&self) -> DriverResult<Box<dyn Page>> {
        Ok(Box::new(ScriptedPage {
            script: Arc::clone(&self.script),
            state: Arc::clone(&self.state),
            current_url: None,
            closed: false,
        }))
    }
}

struct ScriptedPage {
    script: Arc<Script>,
    state: Arc<Mutex<RunState>>,
    current_url: Option<String>,
    closed: bool,
}

impl ScriptedPage {
    fn page_script(&self) -> DriverResult<&PageScript> {
        let url = self.current_url.as_deref().ok_or(DriverError::Closed)?;
        self.script
            .pages
            .get(url)
            .ok_or_else(|| DriverError::Navigation {
                url: url.to_string(),
                reason: "page left the scripted site".to_string(),
            })
    }

    fn consume_stale(&self, selector: &str) -> bool {
        let Some(url) = self.current_url.clone() else {
            return false;
        };
        let mut state = self.state.lock().expect("state lock");
        match state.stale_left.get_mut(&(url, selector.to_string())) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Page for ScriptedPage {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> DriverResult<()> {
        self.ensure_open()?;
        let Some(page) = self.script.pages.get(url) else {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                reason: "no such scripted page".to_string(),
            });
        };
        {
            let mut state = self.state.lock().expect("state lock");
            if let Some(left) = state.nav_failures_left.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(DriverError::Navigation {
                        url: url.to_string(),
                        reason: "scripted load failure".to_string(),
                    });
                }
            }
            state.navigations.push(url.to_string());
        }
        self.current_url = Some(page.landed_url.clone().unwrap_or_else(|| url.to_string()));
        Ok(())
    }

    async fn reload(&mut self) -> DriverResult<()> {
        self.ensure_open()
    }

    fn current_url(&self) -> String {
        self.current_url.clone().unwrap_or_default()
    }

    async fn evaluate(&self, script: &str) -> DriverResult<()> {
        self.ensure_open()?;
        let page = self.page_script()?;
        if page.fail_scripts {
            return Err(DriverError::Script(format!("scripted failure for {script:?}")));
        }
        self.state
            .lock()
            .expect("state lock")
            .evaluated
            .push(script.to_string());
        Ok(())
    }

    async fn query(&self, selector: &str) -> DriverResult<Option<Box<dyn Element>>> {
        Ok(self.query_all(selector).await?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> DriverResult<Vec<Box<dyn Element>>> {
        self.ensure_open()?;
        if self.consume_stale(selector) {
            return Err(DriverError::Stale(selector.to_string()));
        }
        let page = self.page_script()?;
        Ok(page
            .elements
            .get(selector)
            .map(|elements| {
                elements
                    .iter()
                    .map(|script| boxed_element(script.clone(), Arc::clone(&self.state)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn inner_text(&self, selector: &str) -> DriverResult<Option<String>> {
        self.ensure_open()?;
        let page = self.page_script()?;
        Ok(page.texts.get(selector).cloned())
    }

    async fn close(mut self: Box<Self>) -> DriverResult<()> {
        self.closed = true;
        Ok(())
    }
}

fn boxed_element(script: ElementScript, state: Arc<Mutex<RunState>>) -> Box<dyn Element> {
    Box::new(ScriptedElement { script, state })
}

struct ScriptedElement {
    script: ElementScript,
    state: Arc<Mutex<RunState>>,
}

#[async_trait]
impl Element for ScriptedElement {
    async fn inner_text(&self) -> DriverResult<String> {
        Ok(self.script.text.clone())
    }

    async fn attribute(&self, name: &str) -> DriverResult<Option<String>> {
        Ok(self.script.attributes.get(name).cloned())
    }

    async fn is_visible(&self) -> DriverResult<bool> {
        Ok(self.script.visible)
    }

    async fn is_enabled(&self) -> DriverResult<bool> {
        Ok(self.script.enabled)
    }

    async fn query(&self, selector: &str) -> DriverResult<Option<Box<dyn Element>>> {
        Ok(self.query_all(selector).await?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> DriverResult<Vec<Box<dyn Element>>> {
        Ok(self
            .script
            .children
            .get(selector)
            .map(|children| {
                children
                    .iter()
                    .map(|child| boxed_element(child.clone(), Arc::clone(&self.state)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn click(&self) -> DriverResult<()> {
        self.state
            .lock()
            .expect("state lock")
            .clicked
            .push(self.script.label());
        Ok(())
    }
}
