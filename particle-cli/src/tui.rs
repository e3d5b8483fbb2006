//! Interactive terminal chat

use anyhow::Result;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use particle_chat::{ConversationController, ConversationEvent, PendingSend, SendOutcome};
use particle_core::session::{ChatMessage, Sender};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{backend::CrosstermBackend, Frame, Terminal};
use std::io;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const TICK: Duration = Duration::from_millis(60);
const SIDEBAR_WIDTH: u16 = 22;

/// UI state around the controller. The UI loop is the controller's only owner.
struct TuiApp {
    controller: ConversationController,
    input: String,
    scroll: u16,
    follow: bool,
    should_quit: bool,
}

impl TuiApp {
    fn new(controller: ConversationController) -> Self {
        Self {
            controller,
            input: String::new(),
            scroll: 0,
            follow: true,
            should_quit: false,
        }
    }

    /// Apply a key press. Returns a started send for the caller to dispatch.
    fn handle_key(&mut self, key: KeyEvent) -> Option<PendingSend> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => self.should_quit = true,
            KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('n') if ctrl => {
                self.controller.create_session();
                self.follow = true;
            }
            KeyCode::Up if ctrl => self.cycle_session(-1),
            KeyCode::Down if ctrl => self.cycle_session(1),
            KeyCode::BackTab => self.cycle_session(-1),
            KeyCode::Tab => self.cycle_session(1),
            KeyCode::Up => self.scroll_by(-1),
            KeyCode::Down => self.scroll_by(1),
            KeyCode::PageUp => self.scroll_by(-10),
            KeyCode::PageDown => self.scroll_by(10),
            KeyCode::Enter => return self.submit(),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) => self.input.push(ch),
            _ => {}
        }
        None
    }

    fn submit(&mut self) -> Option<PendingSend> {
        if self.controller.is_pending() {
            return None;
        }

        let content = self.input.trim().to_string();
        self.input.clear();
        match content.as_str() {
            "" => None,
            "/quit" => {
                self.should_quit = true;
                None
            }
            "/new" => {
                self.controller.create_session();
                self.follow = true;
                None
            }
            text => match self.controller.begin_send(text) {
                Ok(pending) => {
                    self.follow = true;
                    Some(pending)
                }
                Err(rejected) => {
                    debug!("Send not started: {}", rejected);
                    None
                }
            },
        }
    }

    fn cycle_session(&mut self, step: isize) {
        let len = self.controller.state().len() as isize;
        let current = self.controller.active_index().get() as isize;
        let next = (current + step).rem_euclid(len) as usize;
        if self.controller.select_session(next).is_some() {
            self.follow = true;
        }
    }

    fn scroll_by(&mut self, delta: i32) {
        self.follow = false;
        self.scroll = if delta < 0 {
            self.scroll.saturating_sub(delta.unsigned_abs() as u16)
        } else {
            self.scroll.saturating_add(delta as u16)
        };
    }

    /// Keep the view pinned to the newest message of the active session
    fn apply_event(&mut self, event: &ConversationEvent) {
        let active = self.controller.active_index();
        match event {
            ConversationEvent::MessageAppended { index, .. } if *index == active => {
                self.follow = true;
            }
            ConversationEvent::SessionCreated { .. } | ConversationEvent::SessionSelected { .. } => {
                self.follow = true;
            }
            _ => {}
        }
    }
}

/// Run the full-screen chat until the user quits
pub async fn run(controller: ConversationController) -> Result<()> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, TuiApp::new(controller)).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut app: TuiApp,
) -> Result<()> {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<SendOutcome>();
    let mut events = app.controller.subscribe();

    loop {
        while let Ok(outcome) = outcome_rx.try_recv() {
            app.controller.complete_send(outcome);
        }
        loop {
            match events.try_recv() {
                Ok(event) => app.apply_event(&event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "UI lagged behind conversation events");
                    app.follow = true;
                }
                Err(_) => break,
            }
        }

        terminal.draw(|frame| draw(frame, &mut app))?;

        if event::poll(TICK)? {
            if let CEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(pending) = app.handle_key(key) {
                    let transport = app.controller.transport();
                    let tx = outcome_tx.clone();
                    tokio::spawn(async move {
                        let outcome = pending.dispatch(transport.as_ref()).await;
                        let _ = tx.send(outcome);
                    });
                }
            }
        }

        if app.should_quit {
            info!("Leaving chat");
            break;
        }
    }

    Ok(())
}

fn draw(frame: &mut Frame, app: &mut TuiApp) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(20)])
        .split(frame.area());

    draw_sidebar(frame, app, columns[0]);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(1),
            Constraint::Length(1),
            Constraint::Length(3),
        ])
        .split(columns[1]);

    let state = app.controller.state();
    let active = state.active_index();
    let status = if state.is_pending() {
        Span::styled("Thinking...", Style::default().fg(Color::Yellow))
    } else {
        Span::styled("ready", Style::default().fg(Color::DarkGray))
    };
    let session_label = state
        .active_session()
        .session_id()
        .map(|id| format!("session {}", id))
        .unwrap_or_else(|| "new session".to_string());
    let header = Line::from(vec![
        Span::styled(state.title(active), Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!(" | {} | ", session_label)),
        status,
    ]);
    frame.render_widget(
        Paragraph::new(header).block(Block::default().borders(Borders::ALL).title("particle")),
        rows[0],
    );

    let lines = message_lines(state.active_session().messages());
    let inner_width = rows[1].width.saturating_sub(2).max(1) as usize;
    let inner_height = rows[1].height.saturating_sub(2);
    let total: usize = lines
        .iter()
        .map(|line| line.width().max(1).div_ceil(inner_width))
        .sum();
    let bottom = (total as u16).saturating_sub(inner_height);
    if app.follow || app.scroll > bottom {
        app.scroll = bottom;
    }
    let empty_hint = lines.is_empty();
    let body = if empty_hint {
        Paragraph::new(Line::styled(
            "Ask about a part, a model number, or a repair.",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Paragraph::new(lines)
    };
    frame.render_widget(
        body.block(Block::default().borders(Borders::ALL).title("messages"))
            .wrap(Wrap { trim: false })
            .scroll((app.scroll, 0)),
        rows[1],
    );

    if let Some(error) = app.controller.last_error() {
        frame.render_widget(
            Paragraph::new(Span::styled(
                format!(" error: {}", error),
                Style::default().fg(Color::Red),
            )),
            rows[2],
        );
    }

    let pending = app.controller.is_pending();
    let input_title = if pending {
        "waiting for answer"
    } else {
        "Enter send | Ctrl+N new | Tab switch | Esc quit"
    };
    let input_style = if pending {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };
    frame.render_widget(
        Paragraph::new(app.input.as_str())
            .style(input_style)
            .block(Block::default().borders(Borders::ALL).title(input_title)),
        rows[3],
    );
    if !pending {
        frame.set_cursor_position((cursor_column(rows[3], &app.input), rows[3].y + 1));
    }
}

/// Column just past the typed text, kept inside the bordered input box
fn cursor_column(area: Rect, input: &str) -> u16 {
    let inner_width = area.width.saturating_sub(2);
    let typed = u16::try_from(Span::raw(input).width()).unwrap_or(u16::MAX);
    area.x
        .saturating_add(1)
        .saturating_add(typed.min(inner_width.saturating_sub(1)))
}

fn draw_sidebar(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let state = app.controller.state();
    let items: Vec<ListItem> = state
        .sessions()
        .iter()
        .enumerate()
        .filter_map(|(position, session)| {
            let index = state.index(position)?;
            Some(ListItem::new(Line::from(vec![
                Span::raw(state.title(index)),
                Span::styled(
                    format!(" ({})", session.messages().len()),
                    Style::default().fg(Color::DarkGray),
                ),
            ])))
        })
        .collect();

    let mut list_state = ListState::default();
    list_state.select(Some(state.active_index().get()));
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("chats"))
        .highlight_style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, area, &mut list_state);
}

fn message_lines(messages: &[ChatMessage]) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for message in messages {
        let (label, color) = match message.sender() {
            Sender::User => ("you", Color::Cyan),
            Sender::Bot => ("particle", Color::Green),
        };
        lines.push(Line::from(vec![
            Span::styled(
                format!("{} ", message.created_at().format("%H:%M")),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(
                format!("[{}]", label),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
        ]));
        for text_line in message.text().lines() {
            lines.push(Line::raw(text_line.to_string()));
        }
        for source in message.sources() {
            lines.push(Line::styled(
                format!("  source: {}", source.relevant_doc),
                Style::default().fg(Color::DarkGray),
            ));
        }
        lines.push(Line::raw(""));
    }
    lines
}
