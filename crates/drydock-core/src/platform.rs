// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supported application platforms and their Dockerfile templates.
//!
//! The platform is a closed enum: unknown identifiers are rejected when a
//! plan record is decoded, never at deploy time. Each platform carries a
//! Dockerfile template, a default target port and a flag telling the
//! orchestrator whether entrypoint detection must succeed before the build.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Application platform selected by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// PHP served by Apache.
    Php,
    /// Plain Python script (`app.py`).
    Python,
    /// Django behind gunicorn; requires entrypoint detection.
    Django,
    /// Flask development server.
    Flask,
    /// Node.js application started via `npm start`.
    Nodejs,
    /// Next.js two-stage build.
    Nextjs,
    /// React static build served by nginx.
    React,
    /// Vue static build served by nginx.
    Vue,
    /// Angular static build served by nginx.
    Angular,
    /// Static HTML/CSS served by nginx.
    Static,
    /// Go binary build.
    Go,
    /// .NET application.
    Dotnet,
    /// User-supplied Dockerfile inside the archive.
    Docker,
}

impl Platform {
    /// Default port the application listens on inside the container.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Php | Self::React | Self::Vue | Self::Angular | Self::Static => 80,
            Self::Python | Self::Django | Self::Docker => 8000,
            Self::Flask => 5000,
            Self::Nodejs | Self::Nextjs => 3000,
            Self::Go | Self::Dotnet => 8080,
        }
    }

    /// True when the build cannot proceed without a detected entrypoint.
    pub fn requires_detection(self) -> bool {
        matches!(self, Self::Django)
    }

    /// Render the Dockerfile for this platform.
    ///
    /// Returns `Ok(None)` for [`Platform::Docker`], where the archive itself
    /// must carry a Dockerfile. For Django the detected entrypoint selects
    /// the process manager target; passing `None` there is a validation
    /// error because the orchestrator gates on detection first.
    pub fn dockerfile(
        self,
        entrypoint: Option<&Entrypoint>,
        port: u16,
    ) -> Result<Option<String>, CoreError> {
        let text = match self {
            Self::Docker => return Ok(None),
            Self::Django => {
                let entry = entrypoint.ok_or_else(|| CoreError::ValidationError {
                    field: "entrypoint".to_string(),
                    message: "django requires a detected application entrypoint".to_string(),
                })?;
                let cmd = match entry.kind {
                    EntrypointKind::Wsgi => format!(
                        "CMD [\"gunicorn\", \"{}\", \"--bind\", \"0.0.0.0:{}\"]",
                        entry.target(),
                        port
                    ),
                    EntrypointKind::Asgi => format!(
                        "CMD [\"gunicorn\", \"-k\", \"uvicorn.workers.UvicornWorker\", \"{}\", \"--bind\", \"0.0.0.0:{}\"]",
                        entry.target(),
                        port
                    ),
                };
                format!(
                    "FROM python:3.11-slim\n\
                     ENV PYTHONDONTWRITEBYTECODE=1\n\
                     ENV PYTHONUNBUFFERED=1\n\
                     WORKDIR /app\n\
                     COPY . /app\n\
                     RUN pip install --no-cache-dir -r requirements.txt\n\
                     {}\n",
                    cmd
                )
            }
            Self::Php => "FROM php:8.2-apache\n\
                 COPY . /var/www/html/\n\
                 RUN docker-php-ext-install mysqli pdo pdo_mysql\n\
                 EXPOSE 80\n"
                .to_string(),
            Self::Python => "FROM python:3.11-slim\n\
                 WORKDIR /app\n\
                 COPY . /app\n\
                 RUN pip install --no-cache-dir -r requirements.txt\n\
                 CMD [\"python\", \"app.py\"]\n"
                .to_string(),
            Self::Flask => "FROM python:3.11-slim\n\
                 WORKDIR /app\n\
                 COPY . /app\n\
                 RUN pip install --no-cache-dir -r requirements.txt\n\
                 ENV FLASK_APP=app.py\n\
                 CMD [\"flask\", \"run\", \"--host=0.0.0.0\"]\n"
                .to_string(),
            Self::Nodejs => "FROM node:20-alpine\n\
                 WORKDIR /app\n\
                 COPY . .\n\
                 RUN npm install\n\
                 EXPOSE 3000\n\
                 CMD [\"npm\", \"start\"]\n"
                .to_string(),
            Self::Nextjs => "FROM node:20-alpine AS builder\n\
                 WORKDIR /app\n\
                 COPY . .\n\
                 RUN npm install && npm run build\n\
                 \n\
                 FROM node:20-alpine\n\
                 WORKDIR /app\n\
                 COPY --from=builder /app/.next ./.next\n\
                 COPY --from=builder /app/public ./public\n\
                 COPY --from=builder /app/package.json ./package.json\n\
                 RUN npm install --omit=dev\n\
                 EXPOSE 3000\n\
                 CMD [\"npm\", \"start\"]\n"
                .to_string(),
            Self::React => static_node_build("build"),
            Self::Vue | Self::Angular => static_node_build("dist"),
            Self::Static => "FROM nginx:alpine\n\
                 COPY . /usr/share/nginx/html\n\
                 EXPOSE 80\n"
                .to_string(),
            Self::Go => "FROM golang:1.22-alpine\n\
                 WORKDIR /app\n\
                 COPY . .\n\
                 RUN go build -o main .\n\
                 EXPOSE 8080\n\
                 CMD [\"./main\"]\n"
                .to_string(),
            Self::Dotnet => "FROM mcr.microsoft.com/dotnet/sdk:8.0 AS build\n\
                 WORKDIR /src\n\
                 COPY . .\n\
                 RUN dotnet publish -c Release -o /app/publish\n\
                 \n\
                 FROM mcr.microsoft.com/dotnet/aspnet:8.0\n\
                 WORKDIR /app\n\
                 COPY --from=build /app/publish .\n\
                 EXPOSE 8080\n\
                 ENTRYPOINT [\"dotnet\", \"app.dll\"]\n"
                .to_string(),
        };
        Ok(Some(text))
    }

    /// Stable lowercase identifier, matching the database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Python => "python",
            Self::Django => "django",
            Self::Flask => "flask",
            Self::Nodejs => "nodejs",
            Self::Nextjs => "nextjs",
            Self::React => "react",
            Self::Vue => "vue",
            Self::Angular => "angular",
            Self::Static => "static",
            Self::Go => "go",
            Self::Dotnet => "dotnet",
            Self::Docker => "docker",
        }
    }
}

fn static_node_build(output_dir: &str) -> String {
    format!(
        "FROM node:20-alpine AS builder\n\
         WORKDIR /app\n\
         COPY . .\n\
         RUN npm install && npm run build\n\
         \n\
         FROM nginx:alpine\n\
         COPY --from=builder /app/{} /usr/share/nginx/html\n\
         EXPOSE 80\n",
        output_dir
    )
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "php" => Ok(Self::Php),
            "python" => Ok(Self::Python),
            "django" => Ok(Self::Django),
            "flask" => Ok(Self::Flask),
            "nodejs" => Ok(Self::Nodejs),
            "nextjs" => Ok(Self::Nextjs),
            "react" => Ok(Self::React),
            "vue" => Ok(Self::Vue),
            "angular" => Ok(Self::Angular),
            "static" => Ok(Self::Static),
            "go" => Ok(Self::Go),
            // Legacy records used ".net" as the identifier.
            "dotnet" | ".net" => Ok(Self::Dotnet),
            "docker" => Ok(Self::Docker),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

/// How a detected application entrypoint is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrypointKind {
    /// Synchronous WSGI application.
    Wsgi,
    /// Asynchronous ASGI application.
    Asgi,
}

/// A detected application entrypoint used to parametrize the build template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    /// Whether the application is served synchronously or asynchronously.
    pub kind: EntrypointKind,
    /// Module path holding the application object, e.g. `proj.wsgi`.
    pub module: String,
    /// Attribute name of the application object, usually `application`.
    pub attribute: String,
}

impl Entrypoint {
    /// Process-manager target in `module:attribute` form.
    pub fn target(&self) -> String {
        format!("{}:{}", self.module, self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn wsgi_entrypoint() -> Entrypoint {
        Entrypoint {
            kind: EntrypointKind::Wsgi,
            module: "proj.wsgi".to_string(),
            attribute: "application".to_string(),
        }
    }

    #[test]
    fn test_unknown_platform_rejected() {
        assert!(Platform::from_str("cobol").is_err());
        assert!(Platform::from_str("").is_err());
    }

    #[test]
    fn test_legacy_dotnet_identifier() {
        assert_eq!(Platform::from_str(".net"), Ok(Platform::Dotnet));
        assert_eq!(Platform::from_str("dotnet"), Ok(Platform::Dotnet));
    }

    #[test]
    fn test_roundtrip_identifiers() {
        for platform in [
            Platform::Php,
            Platform::Python,
            Platform::Django,
            Platform::Flask,
            Platform::Nodejs,
            Platform::Nextjs,
            Platform::React,
            Platform::Vue,
            Platform::Angular,
            Platform::Static,
            Platform::Go,
            Platform::Dotnet,
            Platform::Docker,
        ] {
            assert_eq!(Platform::from_str(platform.as_str()), Ok(platform));
        }
    }

    #[test]
    fn test_django_wsgi_command() {
        let dockerfile = Platform::Django
            .dockerfile(Some(&wsgi_entrypoint()), 8000)
            .unwrap()
            .unwrap();
        assert!(dockerfile.contains("proj.wsgi:application"));
        assert!(dockerfile.contains("--bind"));
        assert!(dockerfile.contains("0.0.0.0:8000"));
        assert!(!dockerfile.contains("UvicornWorker"));
    }

    #[test]
    fn test_django_asgi_command() {
        let entry = Entrypoint {
            kind: EntrypointKind::Asgi,
            module: "proj.asgi".to_string(),
            attribute: "application".to_string(),
        };
        let dockerfile = Platform::Django.dockerfile(Some(&entry), 8000).unwrap().unwrap();
        assert!(dockerfile.contains("uvicorn.workers.UvicornWorker"));
        assert!(dockerfile.contains("proj.asgi:application"));
    }

    #[test]
    fn test_django_without_entrypoint_is_rejected() {
        let err = Platform::Django.dockerfile(None, 8000).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_docker_platform_has_no_template() {
        assert_eq!(Platform::Docker.dockerfile(None, 8000).unwrap(), None);
    }

    #[test]
    fn test_detection_flags() {
        assert!(Platform::Django.requires_detection());
        assert!(!Platform::Nodejs.requires_detection());
        assert!(!Platform::Docker.requires_detection());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Platform::Php.default_port(), 80);
        assert_eq!(Platform::Flask.default_port(), 5000);
        assert_eq!(Platform::Nextjs.default_port(), 3000);
        assert_eq!(Platform::Go.default_port(), 8080);
    }

    #[test]
    fn test_entrypoint_target() {
        assert_eq!(wsgi_entrypoint().target(), "proj.wsgi:application");
    }
}
