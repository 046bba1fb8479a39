// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Terminal status panel.
//!
//! Runs on the unprivileged side after the fork. It redraws twice a
//! second from the shared mirror and turns key presses into intents; it
//! never touches the EC itself.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
};

use crate::shared::{FanReadings, IntentView};
use crate::supervisor::ShutdownTokens;

/// Redraw/poll cadence.
const TICK: Duration = Duration::from_millis(500);

/// Fastest spin the hardware reaches, scaling the load bars.
const MAX_FAN_RPM: i32 = 4400;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct App<'a> {
    share: IntentView<'a>,
    running: bool,
    readings: FanReadings,
    status_message: String,
}

impl App<'_> {
    fn handle_key(&mut self, key: KeyCode, modifiers: KeyModifiers) {
        match key {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.running = false;
            }
            KeyCode::Char('q') | KeyCode::Esc => self.running = false,
            KeyCode::Char('a') => {
                self.share.request_auto();
                self.status_message = "automatic fan control".to_string();
            }
            KeyCode::Char(c @ '4'..='9') => {
                let duty = (c as i32 - '0' as i32) * 10;
                self.share.request_manual_duty(duty);
                self.status_message = format!("manual fan duty {duty}%");
            }
            KeyCode::Char('0') => {
                self.share.request_manual_duty(100);
                self.status_message = "manual fan duty 100%".to_string();
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the panel until the user quits, a termination signal arrives, or
/// the control worker dies.
pub fn run(share: IntentView<'_>, tokens: &ShutdownTokens) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App {
        share,
        running: true,
        readings: FanReadings::default(),
        status_message: String::new(),
    };
    let result = run_app(&mut terminal, &mut app, tokens);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    tokens: &ShutdownTokens,
) -> anyhow::Result<()> {
    while app.running {
        if tokens.term.load(Ordering::Relaxed) {
            break;
        }
        if tokens.child_died.load(Ordering::Relaxed) {
            // Without a live worker there is nothing to show or control.
            log::warn!("control worker died, closing the panel");
            break;
        }

        app.readings = app.share.readings();
        terminal.draw(|f| draw(f, app))?;

        if event::poll(TICK)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code, key.modifiers);
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Drawing
// ---------------------------------------------------------------------------

fn draw(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(3),
            Constraint::Min(4),
        ])
        .split(f.area());

    draw_zones(f, app, chunks[0]);
    draw_mode(f, app, chunks[1]);
    draw_status_bar(f, app, chunks[2]);
}

fn draw_zones(f: &mut Frame, app: &App, area: Rect) {
    let r = &app.readings;
    let rows = vec![
        zone_row("CPU", r.cpu_temp, r.cpu_duty, r.cpu_rpm),
        zone_row("GPU", r.gpu_temp, r.gpu_duty, r.gpu_rpm),
    ];

    let table = Table::new(
        rows,
        [
            Constraint::Length(5),
            Constraint::Length(7),
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Min(12),
        ],
    )
    .header(
        Row::new(vec!["Zone", "Temp", "Duty", "Speed", "Load"])
            .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title(" Fans "));

    f.render_widget(table, area);
}

fn zone_row(label: &str, temp: i32, duty: i32, rpm: i32) -> Row<'static> {
    let temp_color = if temp >= 80 {
        Color::Red
    } else if temp >= 60 {
        Color::Yellow
    } else {
        Color::Green
    };
    Row::new(vec![
        Cell::from(label.to_string()),
        Cell::from(Span::styled(
            format!("{temp}°C"),
            Style::default().fg(temp_color),
        )),
        Cell::from(format!("{duty}%")),
        Cell::from(format!("{rpm} RPM")),
        Cell::from(load_bar(rpm)),
    ])
}

fn load_bar(rpm: i32) -> String {
    let width = 10usize;
    let filled = (rpm.clamp(0, MAX_FAN_RPM) as usize * width) / MAX_FAN_RPM as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn draw_mode(f: &mut Frame, app: &App, area: Rect) {
    let mode = if app.share.auto_mode() {
        Span::styled(
            " AUTO ",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )
    } else {
        Span::styled(
            format!(" MANUAL {}% ", app.share.manual_applied()),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )
    };
    let line = Line::from(vec![Span::raw("Fan control: "), mode]);
    let widget = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title(" Mode "));
    f.render_widget(widget, area);
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let lines = vec![
        Line::from(Span::raw(format!(" {}", app.status_message))),
        Line::from(Span::styled(
            " [a] auto   [4-9] 40-90%   [0] 100%   [q] quit",
            Style::default().fg(Color::DarkGray),
        )),
    ];
    let widget = Paragraph::new(lines).block(Block::default().borders(Borders::ALL));
    f.render_widget(widget, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ShareBlock;

    fn app(block: &ShareBlock) -> App<'_> {
        App {
            share: block.intent_view(),
            running: true,
            readings: FanReadings::default(),
            status_message: String::new(),
        }
    }

    #[test]
    fn digit_keys_post_manual_duties() {
        let block = ShareBlock::new();
        let mut app = app(&block);

        app.handle_key(KeyCode::Char('7'), KeyModifiers::NONE);
        assert_eq!(block.worker_view().manual_request(), 70);
        assert!(!block.worker_view().auto_mode());

        app.handle_key(KeyCode::Char('0'), KeyModifiers::NONE);
        assert_eq!(block.worker_view().manual_request(), 100);
    }

    #[test]
    fn auto_key_returns_control_to_the_tables() {
        let block = ShareBlock::new();
        let mut app = app(&block);

        app.handle_key(KeyCode::Char('5'), KeyModifiers::NONE);
        app.handle_key(KeyCode::Char('a'), KeyModifiers::NONE);
        assert!(block.worker_view().auto_mode());
        assert_eq!(block.worker_view().manual_request(), 0);
    }

    #[test]
    fn quit_keys_stop_the_panel() {
        let block = ShareBlock::new();

        let mut a = app(&block);
        a.handle_key(KeyCode::Char('q'), KeyModifiers::NONE);
        assert!(!a.running);

        let mut a = app(&block);
        a.handle_key(KeyCode::Esc, KeyModifiers::NONE);
        assert!(!a.running);

        let mut a = app(&block);
        a.handle_key(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(!a.running);
    }

    #[test]
    fn unbound_keys_change_nothing() {
        let block = ShareBlock::new();
        let mut a = app(&block);
        a.handle_key(KeyCode::Char('x'), KeyModifiers::NONE);
        assert!(a.running);
        assert!(block.worker_view().auto_mode());
        assert_eq!(block.worker_view().manual_request(), 0);
    }

    #[test]
    fn load_bar_scales_with_rpm() {
        assert_eq!(load_bar(0), "░░░░░░░░░░");
        assert_eq!(load_bar(MAX_FAN_RPM), "██████████");
        assert_eq!(load_bar(MAX_FAN_RPM / 2), "█████░░░░░");
        // Out-of-range values clamp instead of panicking.
        assert_eq!(load_bar(-50), "░░░░░░░░░░");
        assert_eq!(load_bar(99_999), "██████████");
    }
}
