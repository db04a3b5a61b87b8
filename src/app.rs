use std::mem;
use std::time::Duration;

use ratatui::widgets::ListState;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::{Config, DEFAULT_MODEL};
use crate::ollama::{CompletionError, CompletionRequest, OllamaClient};
use crate::session::{Session, Turn};

/// What we currently know about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Conversation state
    pub session: Session,
    pub last_error: Option<String>,

    // Input state
    pub input: String,
    pub input_cursor: usize, // cursor position in input, in characters

    // In-flight request state
    pub loading: bool,
    pub completion_task: Option<JoinHandle<Result<String, CompletionError>>>,

    // Availability state (advisory, refreshed on demand)
    pub availability: Availability,
    pub probe_task: Option<JoinHandle<bool>>,

    // Chat viewport
    pub chat_scroll: u16,
    pub chat_height: u16, // Height of chat area for scroll calculations
    pub chat_width: u16,  // Width of chat area for wrap calculations

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Model picker state
    pub show_model_picker: bool,
    pub available_models: Vec<String>,
    pub model_picker_state: ListState,

    // Request settings
    pub model: String,
    pub timeout: Duration,
    pub ollama: OllamaClient,
}

impl App {
    pub fn new(ollama: OllamaClient, model: String, timeout: Duration) -> Self {
        Self {
            should_quit: false,
            input_mode: InputMode::Normal,
            session: Session::new(),
            last_error: None,
            input: String::new(),
            input_cursor: 0,
            loading: false,
            completion_task: None,
            availability: Availability::Unknown,
            probe_task: None,
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            animation_frame: 0,
            show_model_picker: false,
            available_models: Vec::new(),
            model_picker_state: ListState::default(),
            model,
            timeout,
            ollama,
        }
    }

    /// Send the typed message to the model.
    ///
    /// Refused while a previous request is still in flight, and for empty
    /// input; in both cases the session is left untouched.
    pub fn submit(&mut self) {
        if self.input.is_empty() || self.completion_task.is_some() {
            return;
        }

        let prompt = mem::take(&mut self.input);
        self.input_cursor = 0;
        self.last_error = None;

        self.session.append(Turn::user(prompt.clone()));
        self.loading = true;

        // Scroll to bottom so "Thinking..." is visible
        self.scroll_to_bottom();

        let request = CompletionRequest {
            model: self.model.clone(),
            prompt,
            timeout: self.timeout,
        };
        let ollama = self.ollama.clone();
        self.completion_task = Some(tokio::spawn(async move { ollama.complete(&request).await }));
    }

    /// Collect results from any finished background task.
    ///
    /// Runs once per event-loop iteration; the tick event guarantees it is
    /// reached even when the keyboard stays idle.
    pub async fn poll_tasks(&mut self) {
        if self
            .completion_task
            .as_ref()
            .is_some_and(|task| task.is_finished())
        {
            if let Some(task) = self.completion_task.take() {
                match task.await {
                    Ok(Ok(reply)) => {
                        self.session.append(Turn::assistant(reply));
                    }
                    Ok(Err(err)) => {
                        error!(%err, "completion failed");
                        self.last_error = Some(err.to_string());
                    }
                    Err(err) => {
                        error!(%err, "completion task failed to run");
                        self.last_error = Some(format!("internal error: {err}"));
                    }
                }
                self.loading = false;
                self.animation_frame = 0;
                self.scroll_to_bottom();
            }
        }

        if self
            .probe_task
            .as_ref()
            .is_some_and(|task| task.is_finished())
        {
            if let Some(task) = self.probe_task.take() {
                self.availability = match task.await {
                    Ok(true) => Availability::Available,
                    _ => Availability::Unavailable,
                };
            }
        }
    }

    /// Kick off a background reachability probe, unless one is already running.
    pub fn refresh_availability(&mut self) {
        if self.probe_task.is_some() {
            return;
        }

        self.availability = Availability::Unknown;
        let ollama = self.ollama.clone();
        self.probe_task = Some(tokio::spawn(async move { ollama.check_availability().await }));
    }

    /// Drop the whole conversation, including any error line.
    ///
    /// A request still in flight is abandoned; its reply would otherwise
    /// land in a transcript the user just emptied.
    pub fn clear_chat(&mut self) {
        if let Some(task) = self.completion_task.take() {
            task.abort();
        }
        self.loading = false;
        self.animation_frame = 0;
        self.session.clear();
        self.last_error = None;
        self.chat_scroll = 0;
    }

    /// Fetch the installed models and show the picker.
    pub async fn open_model_picker(&mut self) {
        match self.ollama.list_models().await {
            Ok(models) if models.is_empty() => {
                self.last_error = Some(format!(
                    "no models installed. Try: ollama pull {DEFAULT_MODEL}"
                ));
            }
            Ok(models) => {
                self.available_models = models;
                // Select current model if in list, otherwise first
                let current_idx = self
                    .available_models
                    .iter()
                    .position(|m| m == &self.model)
                    .unwrap_or(0);
                self.model_picker_state.select(Some(current_idx));
                self.show_model_picker = true;
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
            }
        }
    }

    // Model picker methods
    pub fn model_picker_nav_down(&mut self) {
        let len = self.available_models.len();
        if len > 0 {
            let i = self.model_picker_state.selected().unwrap_or(0);
            self.model_picker_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn model_picker_nav_up(&mut self) {
        let i = self.model_picker_state.selected().unwrap_or(0);
        self.model_picker_state.select(Some(i.saturating_sub(1)));
    }

    pub fn select_model(&mut self) {
        if let Some(i) = self.model_picker_state.selected() {
            if let Some(model) = self.available_models.get(i) {
                self.model = model.clone();
                self.show_model_picker = false;
                if let Err(err) = Config::save_default_model(&self.model) {
                    warn!(%err, "could not persist model choice");
                }
            }
        }
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.loading {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Total transcript height in display lines at the current wrap width.
    pub fn transcript_lines(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        for turn in self.session.turns() {
            total_lines += 1; // Role line ("You:" or "AI:")
            for line in turn.content.lines() {
                // Use character count, not byte length, for proper UTF-8 handling
                let char_count = line.chars().count();
                if char_count == 0 {
                    total_lines += 1; // Empty line still takes one line
                } else {
                    total_lines += ((char_count / wrap_width) + 1) as u16;
                }
            }
            total_lines += 1; // Blank line after turn
        }

        if let Some(error) = &self.last_error {
            total_lines += 1; // "Error:" line
            for line in error.lines() {
                let char_count = line.chars().count();
                if char_count == 0 {
                    total_lines += 1;
                } else {
                    total_lines += ((char_count / wrap_width) + 1) as u16;
                }
            }
            total_lines += 1;
        }

        if self.loading {
            total_lines += 2; // "AI:" + "Thinking..."
        }

        total_lines
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.transcript_lines().saturating_sub(visible_height)
    }

    /// Scroll the chat so the newest line is visible.
    pub fn scroll_to_bottom(&mut self) {
        self.chat_scroll = self.max_scroll();
    }

    pub fn scroll_to_top(&mut self) {
        self.chat_scroll = 0;
    }

    pub fn scroll_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    pub fn scroll_down(&mut self) {
        if self.chat_scroll < self.max_scroll() {
            self.chat_scroll = self.chat_scroll.saturating_add(1);
        }
    }
}
