//! Protocol clients and the flow components built on them
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`sftp`] | Blocking SFTP client (ssh2) |
//! | [`rest`] | HTTP client with Basic, API key, Bearer and OAuth2 auth |
//! | [`credentials`] | Named credential bundles |
//! | [`destination`] | SFTP and HTTP file delivery, [`RemoteOutput`] |
//! | [`file`] | Local directory [`FileInput`] and [`FileOutput`] |
//! | [`pattern`] | File name matching and rendering |

pub mod credentials;
pub mod destination;
pub mod file;
pub mod pattern;
pub mod rest;
pub mod sftp;

pub use credentials::{
    CredentialBundle, Credentials, CredentialsProvider, OAuth2Credentials, SshCredentials,
    StaticCredentialsProvider,
};
pub use destination::{Destination, HttpDestination, HttpMethod, Payload, RemoteOutput, SftpDestination};
pub use file::{FileInput, FileOutput};
pub use pattern::{render_filename, FilePattern};
pub use rest::{RequestBody, RestAuth, RestClient, RestClientConfig, RestResponse, TokenCache};
pub use sftp::{RemoteFile, SftpClient, SftpConfig};
