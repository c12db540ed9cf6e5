use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, TryRecvError};
use std::time::{Duration, Instant};
use std::{
    fmt,
    sync::{Arc, Mutex},
    thread,
};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{CancelToken, ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::ImportError;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Fetch,
    Extract,
    Write,
    Done,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Fetch => "Fetch",
            Phase::Extract => "Extract",
            Phase::Write => "Write",
            Phase::Done => "Done",
        }
    }

    fn index(self) -> usize {
        match self {
            Phase::Resolve => 0,
            Phase::Fetch => 1,
            Phase::Extract => 2,
            Phase::Write => 3,
            Phase::Done => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    active: bool,
    cancelling: bool,
    batches: u64,
}

pub struct Tui {
    kind: ProgressSinkKind,
    database: String,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                if phase == Phase::Write && payload.contains("batch") {
                    state.batches = state.batches.saturating_add(1);
                }
                state.phase = phase;
                state.status = payload.to_string();
            } else {
                state.status = message.clone();
            }

            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            let line = format!("[{}] {message}", timestamp());
            push_bounded(&mut state.logs, line, LOGS_MAX);
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind, database: &str) -> Self {
        Self {
            kind,
            database: database.to_string(),
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Resolve,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                started: Instant::now(),
                active: false,
                cancelling: false,
                batches: 0,
            })),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a worker thread and renders its progress until it returns.
    /// `Esc`/`q` trips `cancel` and keeps rendering until the worker stops.
    pub fn run<F, R>(&mut self, cancel: CancelToken, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, ImportError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let result = loop {
            if let Ok(state) = self.state.lock() {
                let elapsed = state.started.elapsed();
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick, elapsed))
                    .into_diagnostic()?;
            }

            match rx.try_recv() {
                Ok(result) => break result.map_err(miette::Report::new),
                Err(TryRecvError::Disconnected) => {
                    break Err(miette::miette!("import worker stopped without a result"));
                }
                Err(TryRecvError::Empty) => {}
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    self.handle_key(key, &cancel);
                }
            }

            tick = tick.wrapping_add(1);
        };

        self.set_active(false);
        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        handle.join().ok();
        result
    }

    pub fn confirm_delete(&mut self, table: &str) -> miette::Result<bool> {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;

        let confirmed = loop {
            terminal
                .draw(|frame| {
                    let block = Block::default().borders(Borders::ALL).title("Confirm");
                    let text = Paragraph::new(vec![
                        Line::from(Span::styled(
                            format!("Delete ALL rows of {table} and their dependents?"),
                            Style::default().fg(Color::Red),
                        )),
                        Line::from("Press y to confirm, n to cancel."),
                    ])
                    .alignment(Alignment::Center)
                    .block(block);
                    frame.render_widget(text, frame.area());
                })
                .into_diagnostic()?;

            if event::poll(Duration::from_millis(100)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    match key.code {
                        KeyCode::Char('y') | KeyCode::Char('Y') => break true,
                        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => break false,
                        _ => {}
                    }
                }
            }
        };

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        Ok(confirmed)
    }

    fn handle_key(&mut self, key: KeyEvent, cancel: &CancelToken) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => {
                cancel.cancel();
                if let Ok(mut state) = self.state.lock() {
                    state.cancelling = true;
                    state.status = "cancelling, waiting for the current batch".to_string();
                }
            }
            KeyCode::F(4) => {
                if let Ok(mut state) = self.state.lock() {
                    state.view = match state.view {
                        View::Operational => View::Logs,
                        View::Logs => View::Operational,
                    };
                }
                self.log_scroll = 0;
            }
            KeyCode::Up => self.log_scroll = self.log_scroll.saturating_add(1),
            KeyCode::Down => self.log_scroll = self.log_scroll.saturating_sub(1),
            _ => {}
        }
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
                state.phase = Phase::Resolve;
                state.cancelling = false;
            }
        }
    }
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &AppState, tick: usize, elapsed: Duration) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui, tick), chunks[0]);
    match state.view {
        View::Operational => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
                .split(chunks[1]);
            frame.render_widget(draw_status_panel(state, elapsed), main[0]);
            frame.render_widget(draw_details_panel(state, elapsed), main[1]);
        }
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
    }
    let footer = Paragraph::new(Line::from(Span::styled(
        "Esc/q cancel   F4 logs   Up/Down scroll",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(tui: &Tui, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match tui.kind {
        ProgressSinkKind::Geography => "Geography",
        ProgressSinkKind::Companies => "Companies",
        ProgressSinkKind::Delete => "Delete",
    };
    let header_line = Line::from(vec![
        Span::styled(
            "IBGE-IMPORT",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let store_line = Line::from(Span::styled(
        format!("Database: {}", tui.database),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, store_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState, elapsed: Duration) -> Paragraph<'static> {
    let progress = phase_progress(state.phase);
    let phase_color = if state.cancelling {
        Color::Red
    } else if state.active {
        Color::Cyan
    } else {
        Color::Green
    };
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<7} ", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(progress)),
            Span::raw(format!(" {progress:>3}%")),
        ]),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(vec![
            Span::styled("Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", elapsed.as_secs())),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev().take(3) {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_details_panel(state: &AppState, elapsed: Duration) -> Paragraph<'static> {
    let rate = if elapsed.as_secs_f64() > 0.0 {
        state.batches as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    let lines = vec![
        Line::from(Span::styled(
            "DETAILS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Batches written: ", Style::default().fg(Color::Gray)),
            Span::raw(state.batches.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Batches/s: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{rate:.2}")),
        ]),
        Line::from(vec![
            Span::styled("Cancel: ", Style::default().fg(Color::Gray)),
            if state.cancelling {
                Span::styled("requested", Style::default().fg(Color::Red))
            } else {
                Span::styled("no", Style::default().fg(Color::Green))
            },
        ]),
    ];
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .logs
        .iter()
        .map(|line| Line::from(line.clone()))
        .collect();
    let offset = (lines.len() as u16).saturating_sub(scroll.saturating_add(1));
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Logs"))
        .scroll((offset, 0))
        .wrap(Wrap { trim: false })
}

fn phase_progress(phase: Phase) -> u8 {
    (((phase.index() + 1) as f64 / 5.0) * 100.0).min(100.0) as u8
}

fn progress_bar(percent: u8) -> String {
    let total = 10;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Resolve" => Phase::Resolve,
        "Fetch" => Phase::Fetch,
        "Extract" => Phase::Extract,
        "Write" => Phase::Write,
        "Done" => Phase::Done,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
