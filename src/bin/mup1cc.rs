//! `mup1cc` - CORECONF client for MUP1-framed devices
//!
//! Talks to a device over a serial port or TCP bridge, converting YAML or
//! JSON documents to the CBOR/SID wire format and back. Also works
//! offline: `conv` runs the converter on files, `schema` emits a JSON
//! Schema for editor-side validation.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value as Json;

use mup1_coreconf::carrier::Carrier;
use mup1_coreconf::coap::method;
use mup1_coreconf::driver::Driver;
use mup1_coreconf::request::{CoapRequest, RequestOptions, RetryPolicy};
use mup1_coreconf::{json_schema, load_schema, Codec, CodecOptions, ContentFormat, Error, Schema};

#[derive(Parser, Debug)]
#[command(name = "mup1cc", version, about = "CORECONF client for MUP1 devices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a request to a device
    Request(RequestArgs),
    /// Convert between YAML/JSON and CBOR offline
    Conv(ConvArgs),
    /// Emit the JSON Schema for a set of YANG inputs
    Schema(SchemaArgs),
    /// MUP1 ping; prints the device announcement
    Ping(PingArgs),
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Device URI: serial path, termhub://host:port or telnet://host:port
    #[arg(short, long)]
    device: String,

    /// CoAP method
    #[arg(short, long, value_enum)]
    method: Method,

    /// Input document (YAML or JSON); required for methods with a body
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write the response here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = IoFormat::Yaml)]
    format: IoFormat,

    /// Resource path on the device
    #[arg(long, default_value = "/c")]
    path: String,

    /// URI query item (repeatable), e.g. -q d=a
    #[arg(short, long = "query")]
    query: Vec<String>,

    /// Retransmit interval in seconds
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// Retry budget before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    #[command(flatten)]
    schema: SchemaInputs,
}

#[derive(Args, Debug)]
struct ConvArgs {
    /// Input format; guessed from the file name when omitted
    #[arg(long, value_enum)]
    input: Option<IoFormat>,

    /// Output format
    #[arg(long, value_enum, default_value_t = IoFormat::Json)]
    output: IoFormat,

    /// Payload shape
    #[arg(long, default_value = "yang")]
    content: String,

    /// Input file; stdin when omitted
    #[arg(short = 'i', long = "in")]
    infile: Option<PathBuf>,

    /// Output file; stdout when omitted
    #[arg(short = 'o', long = "out")]
    outfile: Option<PathBuf>,

    /// Keep converting past per-item errors
    #[arg(long)]
    continue_on_error: bool,

    #[command(flatten)]
    schema: SchemaInputs,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Payload shape the schema validates
    #[arg(long, default_value = "yang")]
    content: String,

    /// Output file; stdout when omitted
    #[arg(short = 'o', long = "out")]
    outfile: Option<PathBuf>,

    #[command(flatten)]
    schema: SchemaInputs,
}

#[derive(Args, Debug)]
struct PingArgs {
    /// Device URI
    #[arg(short, long)]
    device: String,

    /// Seconds to wait for the pong
    #[arg(long, default_value_t = 3)]
    timeout: u64,
}

#[derive(Args, Debug)]
struct SchemaInputs {
    /// Normalized YANG module file or .sid file (repeatable)
    #[arg(short = 'y', long = "yang")]
    yang: Vec<PathBuf>,

    /// Schema cache directory; defaults to the system temp dir
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Disable the schema cache
    #[arg(long)]
    no_cache: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
    Fetch,
    Ipatch,
}

impl Method {
    fn code(self) -> u8 {
        match self {
            Method::Get => method::GET,
            Method::Post => method::POST,
            Method::Put => method::PUT,
            Method::Delete => method::DELETE,
            Method::Fetch => method::FETCH,
            Method::Ipatch => method::IPATCH,
        }
    }

    fn content(self) -> ContentFormat {
        match self {
            Method::Get | Method::Delete => ContentFormat::Get,
            Method::Post => ContentFormat::Post,
            Method::Put => ContentFormat::Put,
            Method::Fetch => ContentFormat::Fetch,
            Method::Ipatch => ContentFormat::Ipatch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum IoFormat {
    Yaml,
    Json,
    Cbor,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> mup1_coreconf::Result<()> {
    match cli.command {
        Command::Request(cmd) => run_request(cmd),
        Command::Conv(cmd) => run_conv(cmd),
        Command::Schema(cmd) => run_schema(cmd),
        Command::Ping(cmd) => run_ping(cmd),
    }
}

fn load_inputs(inputs: &SchemaInputs) -> mup1_coreconf::Result<Schema> {
    if inputs.yang.is_empty() {
        return Err(Error::Schema("no YANG inputs given (use -y)".into()));
    }
    let default_cache;
    let cache_dir = if inputs.no_cache {
        None
    } else {
        match &inputs.cache_dir {
            Some(dir) => Some(dir.as_path()),
            None => {
                default_cache = std::env::temp_dir().join("mup1cc-schema-cache");
                Some(default_cache.as_path())
            }
        }
    };
    load_schema(&inputs.yang, cache_dir)
}

fn run_request(cmd: RequestArgs) -> mup1_coreconf::Result<()> {
    let schema = load_inputs(&cmd.schema)?;
    let content = cmd.method.content();
    let opts = CodecOptions {
        content,
        continue_on_error: false,
    };
    let codec = Codec::new(&schema, opts);

    let payload = match &cmd.input {
        Some(path) => {
            let json = read_document(Some(path.clone()), None, &codec)?;
            Some(codec.encode_payload(&json)?)
        }
        None => None,
    };

    let mut uri = cmd.path.clone();
    if !cmd.query.is_empty() {
        uri.push('?');
        uri.push_str(&cmd.query.join("&"));
    }

    let options = RequestOptions {
        content_format: payload.as_ref().and(content.request_content_format()),
        accept: content.accept(),
    };
    let policy = RetryPolicy {
        interval: Duration::from_secs(cmd.timeout.max(1)),
        budget: cmd.retries,
    };

    let carrier = Carrier::open(&cmd.device)?;
    let mut driver = Driver::new(carrier);
    let record = driver.request(CoapRequest::with_policy(
        cmd.method.code(),
        &uri,
        payload,
        options,
        policy,
    ))?;

    match record.code {
        Some((class, detail)) if class == 2 => {
            log::info!("device returned {}.{:02}", class, detail);
        }
        Some((class, detail)) => {
            let diagnostic = String::from_utf8_lossy(&record.payload).into_owned();
            return Err(Error::Request(format!(
                "device returned {}.{:02}: {}",
                class, detail, diagnostic
            )));
        }
        None => return Err(Error::Request("no response from device".into())),
    }

    if record.payload.is_empty() {
        return Ok(());
    }
    let json = codec.decode_payload(&record.payload)?;
    write_document(&json, cmd.output.clone(), cmd.format, &codec)
}

fn run_conv(cmd: ConvArgs) -> mup1_coreconf::Result<()> {
    let schema = load_inputs(&cmd.schema)?;
    let content = ContentFormat::from_str(&cmd.content)?;
    let opts = CodecOptions {
        content,
        continue_on_error: cmd.continue_on_error,
    };
    let codec = Codec::new(&schema, opts);

    let in_format = cmd
        .input
        .or_else(|| cmd.infile.as_deref().and_then(guess_format))
        .unwrap_or(IoFormat::Yaml);

    let json = match in_format {
        IoFormat::Cbor => {
            let bytes = read_bytes(cmd.infile.clone())?;
            codec.decode_payload(&bytes)?
        }
        IoFormat::Yaml | IoFormat::Json => {
            let text = read_text(cmd.infile.clone())?;
            parse_text(&text, in_format)?
        }
    };

    write_document(&json, cmd.outfile.clone(), cmd.output, &codec)
}

fn run_schema(cmd: SchemaArgs) -> mup1_coreconf::Result<()> {
    let schema = load_inputs(&cmd.schema)?;
    let content = ContentFormat::from_str(&cmd.content)?;
    let doc = json_schema::emit(&schema, content);
    let text = serde_json::to_string_pretty(&doc)?;
    match cmd.outfile {
        Some(path) => fs::write(path, text + "\n")?,
        None => println!("{}", text),
    }
    Ok(())
}

fn run_ping(cmd: PingArgs) -> mup1_coreconf::Result<()> {
    let carrier = Carrier::open(&cmd.device)?;
    let mut driver = Driver::new(carrier);
    match driver.ping(Duration::from_secs(cmd.timeout))? {
        Some(announce) => {
            println!("{} {}", announce.version, announce.checksums.join(" "));
            Ok(())
        }
        None => Err(Error::Request("no pong from device".into())),
    }
}

// ----------------------------------------------------------------------
// Document I/O
// ----------------------------------------------------------------------

fn guess_format(path: &std::path::Path) -> Option<IoFormat> {
    match path.extension()?.to_str()? {
        "yaml" | "yml" => Some(IoFormat::Yaml),
        "json" => Some(IoFormat::Json),
        "cbor" | "bin" => Some(IoFormat::Cbor),
        _ => None,
    }
}

fn read_text(path: Option<PathBuf>) -> mup1_coreconf::Result<String> {
    match path {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn read_bytes(path: Option<PathBuf>) -> mup1_coreconf::Result<Vec<u8>> {
    match path {
        Some(path) => Ok(fs::read(path)?),
        None => {
            let mut bytes = Vec::new();
            std::io::stdin().read_to_end(&mut bytes)?;
            Ok(bytes)
        }
    }
}

fn parse_text(text: &str, format: IoFormat) -> mup1_coreconf::Result<Json> {
    match format {
        IoFormat::Json => Ok(serde_json::from_str(text)?),
        _ => Ok(serde_yaml::from_str(text)?),
    }
}

fn read_document(
    path: Option<PathBuf>,
    format: Option<IoFormat>,
    codec: &Codec<'_>,
) -> mup1_coreconf::Result<Json> {
    let format = format
        .or_else(|| path.as_deref().and_then(guess_format))
        .unwrap_or(IoFormat::Yaml);
    match format {
        IoFormat::Cbor => {
            let bytes = read_bytes(path)?;
            codec.decode_payload(&bytes)
        }
        _ => {
            let text = read_text(path)?;
            parse_text(&text, format)
        }
    }
}

fn write_document(
    json: &Json,
    path: Option<PathBuf>,
    format: IoFormat,
    codec: &Codec<'_>,
) -> mup1_coreconf::Result<()> {
    match format {
        IoFormat::Cbor => {
            let bytes = codec.encode_payload(json)?;
            match path {
                Some(path) => fs::write(path, bytes)?,
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        IoFormat::Json => {
            let text = serde_json::to_string_pretty(json)?;
            match path {
                Some(path) => fs::write(path, text + "\n")?,
                None => println!("{}", text),
            }
        }
        IoFormat::Yaml => {
            let text = serde_yaml::to_string(json)?;
            match path {
                Some(path) => fs::write(path, text)?,
                None => print!("{}", text),
            }
        }
    }
    Ok(())
}
