//! Parsing of protocol command lines.
//!
//! A line is split on single spaces; the first token names the command.
//! Playlist and song names travel as one token with `_` standing in for
//! spaces. Tokens beyond what a command needs are ignored.

use super::CommandError;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { email: String, password: String },
    Login { email: String, password: String },
    Disconnect,
    Search { keywords: Vec<String> },
    Top { count: i64 },
    CreatePlaylist { name: String },
    AddSongTo { playlist: String, song: String },
    ShowPlaylist { name: String },
    Play { song: String },
    Stop,
}

impl Command {
    /// Parse one line. Arity is checked before any argument is interpreted.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let name = tokens.next().ok_or(CommandError::Unknown)?;
        let args: Vec<&str> = tokens.collect();

        let command = match name {
            "register" => {
                let [email, password] = take(&args)?;
                Command::Register {
                    email: email.to_string(),
                    password: password.to_string(),
                }
            }
            "login" => {
                let [email, password] = take(&args)?;
                Command::Login {
                    email: email.to_string(),
                    password: password.to_string(),
                }
            }
            "disconnect" => Command::Disconnect,
            "search" => {
                if args.is_empty() {
                    return Err(CommandError::Arity);
                }
                Command::Search {
                    keywords: args.iter().map(|k| k.to_string()).collect(),
                }
            }
            "top" => {
                let [count] = take(&args)?;
                let count = count.parse().map_err(|_| {
                    CommandError::InvalidArgument(format!("{count} is not a valid number of songs"))
                })?;
                Command::Top { count }
            }
            "create-playlist" => {
                let [name] = take(&args)?;
                Command::CreatePlaylist { name: unescape(name) }
            }
            "add-song-to" => {
                let [playlist, song] = take(&args)?;
                Command::AddSongTo {
                    playlist: unescape(playlist),
                    song: unescape(song),
                }
            }
            "show-playlist" => {
                let [name] = take(&args)?;
                Command::ShowPlaylist { name: unescape(name) }
            }
            "play" => {
                let [song] = take(&args)?;
                Command::Play { song: unescape(song) }
            }
            "stop" => Command::Stop,
            _ => return Err(CommandError::Unknown),
        };
        Ok(command)
    }

    /// Protocol name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::Login { .. } => "login",
            Command::Disconnect => "disconnect",
            Command::Search { .. } => "search",
            Command::Top { .. } => "top",
            Command::CreatePlaylist { .. } => "create-playlist",
            Command::AddSongTo { .. } => "add-song-to",
            Command::ShowPlaylist { .. } => "show-playlist",
            Command::Play { .. } => "play",
            Command::Stop => "stop",
        }
    }
}

/// The first `N` arguments, or an arity error.
fn take<'a, const N: usize>(args: &[&'a str]) -> Result<[&'a str; N], CommandError> {
    args.get(..N)
        .and_then(|head| <[&str; N]>::try_from(head).ok())
        .ok_or(CommandError::Arity)
}

fn unescape(token: &str) -> String {
    token.replace('_', " ")
}
