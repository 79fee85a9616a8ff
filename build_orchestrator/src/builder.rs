use std::sync::Arc;

use stacked_errors::StackableErr;

use crate::{
    context::{package, BuildContext, ContextSources},
    error::{BuildError, Result},
    events::BuildLog,
    image::{Image, ImageLookup, Images},
    interpreter::interpret,
    options::BuildOptions,
    transport::{
        default_transport::get_or_init_default_transport, HttpTransport, Transport,
        TransportRequest, TAR_CONTENT_TYPE,
    },
};

/// Everything needed to submit one build
#[derive(Debug, Default)]
pub struct BuildRequest {
    pub options: BuildOptions,
    /// Building without a context is rejected before anything is sent
    pub context: Option<BuildContext>,
}

impl BuildRequest {
    pub fn new(context: BuildContext) -> Self {
        Self {
            options: BuildOptions::default(),
            context: Some(context),
        }
    }

    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses the first of the loose context inputs that is set, see
    /// [ContextSources]
    pub async fn from_sources(options: BuildOptions, sources: ContextSources) -> Result<Self> {
        Ok(Self {
            options,
            context: Some(sources.into_context().await?),
        })
    }
}

/// Submits builds to a daemon and reads back their outcome.
///
/// ```no_run
/// use build_orchestrator::{BuildContext, BuildOptions, BuildRequest, ImageBuilder};
///
/// # async fn example() -> build_orchestrator::Result<()> {
/// let builder = ImageBuilder::from_env().await?;
/// let request = BuildRequest::new(BuildContext::directory("./app")).options(BuildOptions {
///     tag: Some("myimage:latest".to_owned()),
///     ..Default::default()
/// });
/// let (image, log) = builder.build(request).await?;
/// println!("{}\n{}", log.collect_text().await.unwrap_or_default(), image.id());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ImageBuilder<T, L = Images<T>> {
    transport: Arc<T>,
    lookup: L,
}

impl<T: Transport> ImageBuilder<T> {
    /// Uses `transport` for both the build and the image lookup
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<T>) -> Self {
        Self {
            lookup: Images::new(Arc::clone(&transport)),
            transport,
        }
    }
}

impl ImageBuilder<HttpTransport> {
    /// A builder over the process-wide [HttpTransport]
    pub async fn from_env() -> Result<Self> {
        Ok(Self::new(get_or_init_default_transport().await?))
    }
}

impl<T: Transport, L: ImageLookup> ImageBuilder<T, L> {
    /// Resolves reported image ids with `lookup` instead
    pub fn with_lookup<L2: ImageLookup>(self, lookup: L2) -> ImageBuilder<T, L2> {
        ImageBuilder {
            transport: self.transport,
            lookup,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Builds an image.
    ///
    /// On success this returns the built image along with the build log,
    /// which replays every event of the build. A build that the daemon
    /// accepted but that failed is a [BuildError::Build] owning the same
    /// log.
    #[tracing::instrument(skip_all, fields(tag = ?request.options.tag))]
    pub async fn build(&self, request: BuildRequest) -> Result<(Image, BuildLog)> {
        let BuildRequest { options, context } = request;
        let Some(context) = context else {
            return Err(BuildError::config(
                "either `path`, `fileobj` or `remote` must be provided",
            ))
        };
        let mut params = options.to_query_params()?;
        let mut packaged = package(context, &options).await?;
        packaged.apply_params(&mut params);

        let request = TransportRequest {
            path: "/build".to_owned(),
            query: params,
            body: packaged.take_body(),
            headers: vec![("Content-Type".to_owned(), TAR_CONTENT_TYPE.to_owned())],
            timeout: options.timeout(),
        };
        tracing::debug!("submitting build {request:?}");
        let response = self.transport.post(request).await;
        // the staging directory and any copied build file go away whatever
        // the daemon said
        drop(packaged);
        let response = response
            .stack_err("ImageBuilder::build -> POST /build")?
            .error_for_status()
            .await?;

        interpret(response.lines, &self.lookup).await
    }

    /// [ImageBuilder::build] from loose context inputs
    pub async fn build_from_sources(
        &self,
        options: BuildOptions,
        sources: ContextSources,
    ) -> Result<(Image, BuildLog)> {
        self.build(BuildRequest::from_sources(options, sources).await?)
            .await
    }
}
