// uDashBoard: featherweight dashboard application.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Policy dependency resolver with an embedded bytecode VM (spec §1-9).
//
// `policy` is the assembled public surface; everything else is a
// subsystem it wires together. Concrete policy syntax is out of
// scope (spec §1) — `policy::parse_str` takes a structural `ron`
// encoding of `ast::Policy` rather than a bespoke grammar.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod fact_store;
pub mod graph;
pub mod ident;
pub mod instr;
pub mod method;
pub mod policy;
pub mod resolver;
pub mod resolver_config;
pub mod scope;
pub mod serializer;
pub mod toposort;
pub mod value;
pub mod vars;
pub mod vm;

