use analytics_tracing::{init_tracing_to_file, init_tracing_to_stderr};
use clap::{Parser, Subcommand};
use file_downloader::{FileDownload, FileDownloadConfig, HubRepo};
use florence::{
    florence2::{DEFAULT_REPO, DEFAULT_REVISION},
    generation::GenerationConfig,
    remote_code::{self, FLORENCE2_MODELING_FILE},
    tokenizer::{export::export_tokenizer, interactive::encode_loop},
    AIModel, CaptionInput, Device, Florence2, Florence2Config, ImageCaptionModel, Task,
};
use std::{path::PathBuf, str::FromStr};
use tracing::{debug, info};

const SAMPLE_IMAGE_URL: &str = "https://i.imgur.com/drGJSNH.jpeg";
const DEFAULT_CODE_REPO: &str = "microsoft/Florence-2-large";

/// `auto` leaves the choice to the ONNX Runtime build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DevicePreference(Option<Device>);

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self(None));
        }
        Device::from_str(s)
            .map(|device| Self(Some(device)))
            .map_err(|_| format!("unknown device {}, expected auto, cuda, coreml or cpu", s))
    }
}

#[derive(Parser)]
#[command(name = "florence", version, about = "Florence-2 on ONNX Runtime", long_about = None)]
struct Args {
    /// Hub repo holding the ONNX export of Florence-2
    #[arg(long, env = "FLORENCE_MODEL_REPO", default_value = DEFAULT_REPO, global = true)]
    repo: String,

    #[arg(long, default_value = DEFAULT_REVISION, global = true)]
    revision: String,

    /// Downloaded files are cached here
    #[arg(long, env = "FLORENCE_RESOURCES_DIR", default_value = "resources", global = true)]
    resources_dir: PathBuf,

    /// auto, cuda, coreml or cpu
    #[arg(long, env = "FLORENCE_DEVICE", default_value = "auto", global = true)]
    device: DevicePreference,

    /// JSON file overriding the decoding settings
    #[arg(long, global = true)]
    generation_config: Option<PathBuf>,

    /// Write logs to <LOG_DIR>/app.log instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a Florence-2 task on an image and print the answer as JSON
    Caption {
        /// Image url or local path
        #[arg(long, default_value = SAMPLE_IMAGE_URL)]
        image: String,

        /// Task token like <OD> or its name like od
        #[arg(long, default_value = "<MORE_DETAILED_CAPTION>")]
        task: Task,

        /// Required by the tasks that take an input, e.g. <OPEN_VOCABULARY_DETECTION>
        #[arg(long)]
        text_input: Option<String>,
    },
    /// Encode lines read from stdin, `|` separates sentences of a batch
    Tokenize,
    /// Export the tokenizer as ONNX encode and decode graphs
    ExportTokenizer {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Print the device the model would run on
    Device,
    /// List the python packages imported by a remote-code file of the model
    Imports {
        #[arg(long, default_value = FLORENCE2_MODELING_FILE)]
        file: String,

        #[arg(long, default_value = DEFAULT_CODE_REPO)]
        code_repo: String,
    },
}

impl Args {
    fn florence2_config(&self) -> anyhow::Result<Florence2Config> {
        let generation = match &self.generation_config {
            Some(path) => GenerationConfig::from_file(path)?,
            None => GenerationConfig::default(),
        };

        Ok(Florence2Config {
            repo: HubRepo::new(&self.repo, &self.revision),
            resources_dir: self.resources_dir.clone(),
            device: self.device.0,
            generation,
            ..Default::default()
        })
    }
}

async fn read_image(image: &str) -> anyhow::Result<Vec<u8>> {
    if image.starts_with("http://") || image.starts_with("https://") {
        file_downloader::fetch_bytes(image).await
    } else {
        Ok(tokio::fs::read(image).await?)
    }
}

async fn caption(
    config: Florence2Config,
    image: &str,
    task: Task,
    text_input: Option<String>,
) -> anyhow::Result<()> {
    // fail before any download when the input does not fit the task
    task.prompt(text_input.as_deref())?;

    let image = read_image(image).await?;
    debug!("image loaded, {} bytes", image.len());

    let model: ImageCaptionModel = AIModel::new(
        config.repo.id.clone(),
        move || Florence2::new(config.clone()),
        None,
    )?;

    let mut input = CaptionInput::new(image, task);
    input.text_input = text_input;

    let answer = model.process_single(input).await?;
    println!("{}", serde_json::to_string_pretty(&answer.to_json(task)?)?);

    Ok(())
}

async fn imports(resources_dir: PathBuf, repo: HubRepo, file: &str) -> anyhow::Result<()> {
    let download = FileDownload::new(FileDownloadConfig {
        resources_dir,
        ..Default::default()
    });
    let path = download.download_repo_file_if_not_exists(&repo, file).await?;

    let imports = remote_code::fixed_get_imports(&path)?;
    println!("{}", serde_json::to_string(&imports)?);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match &args.log_dir {
        Some(log_dir) => init_tracing_to_file(log_dir.clone()),
        None => init_tracing_to_stderr(),
    }

    match &args.command {
        Command::Caption {
            image,
            task,
            text_input,
        } => caption(args.florence2_config()?, image, *task, text_input.clone()).await?,
        Command::Tokenize => {
            let tokenizer = args.florence2_config()?.load_tokenizer().await?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let handled = encode_loop(&tokenizer, stdin, std::io::stdout()).await?;
            debug!("{} lines encoded", handled);
        }
        Command::ExportTokenizer { out_dir } => {
            let tokenizer = args.florence2_config()?.load_tokenizer().await?;
            let files = export_tokenizer(&tokenizer, out_dir)?;
            info!("tokenizer exported");
            println!("{}", files.encode.display());
            println!("{}", files.decode.display());
            println!("{}", files.decode_skip_special_tokens.display());
        }
        Command::Device => {
            println!("{}", Device::resolve(args.device.0));
        }
        Command::Imports { file, code_repo } => {
            imports(
                args.resources_dir.clone(),
                HubRepo::new(code_repo, &args.revision),
                file,
            )
            .await?
        }
    }

    Ok(())
}
