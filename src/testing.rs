//! Fakes and fixtures shared by the unit tests.

use crate::db::models::{ArtistCredit, LinkedAccount, NewPlayEvent, RefreshStrategy};
use crate::error::{NotifyError, SpotifyError};
use crate::notify::{ChatDestination, NotificationKind, Notifier};
use crate::spotify::{RecentPlaysPage, RefreshedToken, SpotifyApi};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn linked_account(expires_at: DateTime<Utc>) -> LinkedAccount {
    LinkedAccount {
        id: Uuid::new_v4(),
        spotify_user_id: format!("spotify-{}", Uuid::new_v4()),
        access_token: "access_token".to_string(),
        refresh_token: "refresh_token".to_string(),
        expires_at,
        client_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn artist(id: &str) -> ArtistCredit {
    ArtistCredit {
        id: id.to_string(),
        name: format!("Artist {}", id),
    }
}

pub fn play(
    track_id: &str,
    artists: Vec<ArtistCredit>,
    duration_ms: i32,
    played_at: DateTime<Utc>,
) -> NewPlayEvent {
    NewPlayEvent {
        track_id: track_id.to_string(),
        track_name: format!("Track {}", track_id),
        artists,
        album_name: "Album".to_string(),
        duration_ms,
        played_at,
        context_type: None,
        context_uri: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub access_token: String,
    pub after: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Scripted Spotify. Unscripted fetches return an empty page; unscripted
/// refreshes fail transiently.
#[derive(Default)]
pub struct FakeSpotify {
    pages: Mutex<VecDeque<Result<RecentPlaysPage, SpotifyError>>>,
    refreshes: Mutex<VecDeque<Result<RefreshedToken, SpotifyError>>>,
    fetch_calls: Mutex<Vec<FetchCall>>,
    refresh_calls: Mutex<Vec<(String, RefreshStrategy)>>,
}

impl FakeSpotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: Result<RecentPlaysPage, SpotifyError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn push_refresh(&self, result: Result<RefreshedToken, SpotifyError>) {
        self.refreshes.lock().unwrap().push_back(result);
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn refresh_calls(&self) -> Vec<(String, RefreshStrategy)> {
        self.refresh_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpotifyApi for FakeSpotify {
    async fn fetch_recent_plays(
        &self,
        access_token: &str,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<RecentPlaysPage, SpotifyError> {
        self.fetch_calls.lock().unwrap().push(FetchCall {
            access_token: access_token.to_string(),
            after,
            limit,
        });
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RecentPlaysPage::default()))
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        strategy: &RefreshStrategy,
    ) -> Result<RefreshedToken, SpotifyError> {
        self.refresh_calls
            .lock()
            .unwrap()
            .push((refresh_token.to_string(), strategy.clone()));
        self.refreshes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SpotifyError::Api("no refresh scripted".to_string())))
    }
}

/// Records every notification attempt; fails for the configured channels.
#[derive(Default)]
pub struct RecordingNotifier {
    attempts: Mutex<Vec<(ChatDestination, NotificationKind)>>,
    failing_channels: HashSet<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(channels: &[&str]) -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            failing_channels: channels.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn attempts(&self) -> Vec<(ChatDestination, NotificationKind)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        destination: &ChatDestination,
        kind: &NotificationKind,
    ) -> Result<(), NotifyError> {
        self.attempts
            .lock()
            .unwrap()
            .push((destination.clone(), kind.clone()));

        if self.failing_channels.contains(&destination.channel) {
            return Err(NotifyError::SlackApi("channel_not_found".to_string()));
        }
        Ok(())
    }
}

/// Answer the first HTTP request on a local port with a canned response.
///
/// Returns the base URL and a handle resolving to the raw request text.
pub async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        request
    });

    (format!("http://{}", addr), handle)
}

/// Read headers plus a `Content-Length` body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
